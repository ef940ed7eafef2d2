//! HTTP long-polling fallback socket used for `http://` / `https://` URLs.
//!
//! Outbound frames are POSTed to `<url>/send`; inbound frames arrive from a
//! long `GET <url>/poll` loop as newline-delimited payload lines. A bare `h`
//! line is a server heartbeat and surfaces as [`Frame::Ping`] so the session
//! watchdog counts it as liveness.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{ClientError, Frame, frame_bytes};

use super::{Transport, TransportConnectFuture};

const HEARTBEAT_LINE: &str = "h";

#[derive(Clone)]
pub struct PollingTransport {
    http: reqwest::Client,
}

impl Default for PollingTransport {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl PollingTransport {
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

pub struct PollingReader {
    rx: mpsc::UnboundedReceiver<Result<Frame, ClientError>>,
}

impl Stream for PollingReader {
    type Item = Result<Frame, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

pub struct PollingWriter {
    tx: mpsc::UnboundedSender<Frame>,
}

impl Sink<Frame> for PollingWriter {
    type Error = ClientError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.get_mut().tx.send(item).map_err(|_| ClientError::Transport {
            context: "polling_write",
            error: "send loop stopped".to_string(),
        })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

fn parse_poll_body(body: &str, inbound: &mpsc::UnboundedSender<Result<Frame, ClientError>>) {
    for line in body.lines() {
        if line.is_empty() {
            continue;
        }
        let frame = if line == HEARTBEAT_LINE {
            Frame::Ping(Bytes::new())
        } else {
            Frame::Text(Bytes::from(line.to_string()))
        };
        if inbound.send(Ok(frame)).is_err() {
            return;
        }
    }
}

impl Transport for PollingTransport {
    type Reader = PollingReader;
    type Writer = PollingWriter;

    fn name(&self) -> &'static str {
        "polling"
    }

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let http = self.http.clone();
        Box::pin(async move {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

            let poll_url = format!("{}/poll", url.trim_end_matches('/'));
            let send_url = format!("{}/send", url.trim_end_matches('/'));

            // Probe the poll endpoint once so connect fails fast on a dead URL.
            let first = http
                .get(&poll_url)
                .send()
                .await
                .map_err(|e| ClientError::Transport {
                    context: "polling_connect",
                    error: e.to_string(),
                })?;
            if !first.status().is_success() {
                return Err(ClientError::Transport {
                    context: "polling_connect",
                    error: format!("poll endpoint returned {}", first.status()),
                });
            }
            if let Ok(body) = first.text().await {
                parse_poll_body(&body, &inbound_tx);
            }

            let poll_http = http.clone();
            let poll_inbound = inbound_tx.clone();
            tokio::spawn(async move {
                loop {
                    if poll_inbound.is_closed() {
                        break;
                    }
                    match poll_http.get(&poll_url).send().await {
                        Ok(resp) if resp.status().is_success() => match resp.text().await {
                            Ok(body) => parse_poll_body(&body, &poll_inbound),
                            Err(err) => {
                                let _ = poll_inbound.send(Err(ClientError::Transport {
                                    context: "polling_read",
                                    error: err.to_string(),
                                }));
                                break;
                            }
                        },
                        Ok(resp) => {
                            debug!(status = %resp.status(), "poll request rejected");
                            let _ = poll_inbound.send(Err(ClientError::Transport {
                                context: "polling_read",
                                error: format!("poll endpoint returned {}", resp.status()),
                            }));
                            break;
                        }
                        Err(err) => {
                            let _ = poll_inbound.send(Err(ClientError::Transport {
                                context: "polling_read",
                                error: err.to_string(),
                            }));
                            break;
                        }
                    }
                }
            });

            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let Some(bytes) = frame_bytes(&frame).map(|b| b.to_vec()) else {
                        // Close frame ends the polling session.
                        break;
                    };
                    match http.post(&send_url).body(bytes).send().await {
                        Ok(resp) if resp.status().is_success() => {}
                        Ok(resp) => {
                            let _ = inbound_tx.send(Err(ClientError::Transport {
                                context: "polling_write",
                                error: format!("send endpoint returned {}", resp.status()),
                            }));
                            break;
                        }
                        Err(err) => {
                            let _ = inbound_tx.send(Err(ClientError::Transport {
                                context: "polling_write",
                                error: err.to_string(),
                            }));
                            break;
                        }
                    }
                }
            });

            Ok((
                PollingReader { rx: inbound_rx },
                PollingWriter { tx: outbound_tx },
            ))
        })
    }
}
