use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async as tungstenite_connect,
    connect_async_tls_with_config as tungstenite_connect_tls,
    tungstenite::{
        Error as WireError, Message as WireMessage, protocol::CloseFrame as WireCloseFrame,
    },
};

use crate::core::{ClientError, CloseFrame, Frame};
use crate::tls::install_rustls_crypto_provider;

use super::{Transport, TransportConnectFuture};

fn read_failed(err: WireError) -> ClientError {
    ClientError::Transport {
        context: "read",
        error: err.to_string(),
    }
}

fn write_failed(err: WireError) -> ClientError {
    ClientError::Transport {
        context: "write",
        error: err.to_string(),
    }
}

impl From<WireCloseFrame> for CloseFrame {
    fn from(frame: WireCloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: Bytes::from(frame.reason),
        }
    }
}

impl From<CloseFrame> for WireCloseFrame {
    fn from(frame: CloseFrame) -> Self {
        // Close reasons must be UTF-8 on the wire; replace what isn't.
        let reason = String::from_utf8_lossy(frame.reason.as_ref()).into_owned();
        Self {
            code: frame.code.into(),
            reason: reason.into(),
        }
    }
}

impl From<WireMessage> for Frame {
    fn from(message: WireMessage) -> Self {
        match message {
            WireMessage::Text(text) => Frame::Text(Bytes::from(text)),
            WireMessage::Binary(payload) => Frame::Binary(payload),
            WireMessage::Ping(payload) => Frame::Ping(payload),
            WireMessage::Pong(payload) => Frame::Pong(payload),
            WireMessage::Close(frame) => Frame::Close(frame.map(CloseFrame::from)),
            // Raw frames are never yielded by the high-level reader.
            WireMessage::Frame(_) => Frame::Binary(Bytes::new()),
        }
    }
}

impl From<Frame> for WireMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(payload) => match String::from_utf8(payload.into()) {
                Ok(text) => WireMessage::text(text),
                // A text frame with broken UTF-8 goes out as binary instead.
                Err(err) => WireMessage::Binary(err.into_bytes().into()),
            },
            Frame::Binary(payload) => WireMessage::Binary(payload),
            Frame::Ping(payload) => WireMessage::Ping(payload),
            Frame::Pong(payload) => WireMessage::Pong(payload),
            Frame::Close(frame) => WireMessage::Close(frame.map(WireCloseFrame::from)),
        }
    }
}

/// Native message socket used for `ws://` / `wss://` URLs.
#[derive(Clone, Default)]
pub struct WebSocketTransport {
    connector: Option<Connector>,
}

impl WebSocketTransport {
    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
        }
    }

    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }
}

pub struct WebSocketReader {
    inner: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl Stream for WebSocketReader {
    type Item = Result<Frame, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|next| next.map(|result| result.map(Frame::from).map_err(read_failed)))
    }
}

pub struct WebSocketWriter {
    inner:
        futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WireMessage>,
}

impl Sink<Frame> for WebSocketWriter {
    type Error = ClientError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(write_failed)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(item.into())
            .map_err(write_failed)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(write_failed)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(write_failed)
    }
}

impl Transport for WebSocketTransport {
    type Reader = WebSocketReader;
    type Writer = WebSocketWriter;

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let connector = self.connector.clone();
        Box::pin(async move {
            install_rustls_crypto_provider();

            let connect_failed = |err: WireError| ClientError::Transport {
                context: "connect",
                error: err.to_string(),
            };
            let (stream, _) = match connector {
                Some(connector) => {
                    tungstenite_connect_tls(url, None, false, Some(connector))
                        .await
                        .map_err(connect_failed)?
                }
                None => tungstenite_connect(url).await.map_err(connect_failed)?,
            };

            let (write, read) = stream.split();
            Ok((
                WebSocketReader { inner: read },
                WebSocketWriter { inner: write },
            ))
        })
    }
}
