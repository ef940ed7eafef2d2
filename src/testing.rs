//! Reusable test utilities for exercising the session without real sockets.
//!
//! [`MockTransport`] pairs with a [`MockBroker`] handle that receives outbound
//! frames, pushes inbound frames and drops the socket; [`MockPoster`] scripts
//! the HTTP side-channels. Integration tests drive full reconnect/refresh
//! flows deterministically with these.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Sink;
use futures_util::future::BoxFuture;
use sonic_rs::Value;
use tokio::sync::mpsc;

use crate::core::backoff::ReconnectStrategy;
use crate::core::types::{ClientError, ClientResult};
use crate::core::Frame;
use crate::http::HttpPoster;
use crate::transport::{Transport, TransportConnectFuture};

type FrameResult = Result<Frame, ClientError>;

/// In-memory transport; every `connect` call produces a fresh connection and
/// hands its broker-side endpoints to the paired [`MockBroker`].
#[derive(Clone)]
pub struct MockTransport {
    connections: mpsc::UnboundedSender<BrokerConnection>,
}

impl MockTransport {
    /// Build a transport + broker control pair.
    pub fn pair() -> (Self, MockBroker) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        (
            Self { connections: conn_tx },
            MockBroker {
                connections: conn_rx,
            },
        )
    }
}

impl Transport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn connect(&self, _url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let connections = self.connections.clone();
        Box::pin(async move {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<FrameResult>();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
            let handle = BrokerConnection {
                inbound: inbound_tx,
                outbound: outbound_rx,
            };
            connections.send(handle).map_err(|_| ClientError::Transport {
                context: "mock_connect",
                error: "broker handle dropped".to_string(),
            })?;
            Ok((
                MockReader { rx: inbound_rx },
                MockWriter { tx: outbound_tx },
            ))
        })
    }
}

/// Broker side of one mock connection.
pub struct BrokerConnection {
    inbound: mpsc::UnboundedSender<FrameResult>,
    outbound: mpsc::UnboundedReceiver<Frame>,
}

impl BrokerConnection {
    /// Receive a frame written by the session.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .unwrap_or_default()
    }

    /// Push an inbound frame to the session.
    pub fn send(&self, frame: Frame) {
        let _ = self.inbound.send(Ok(frame));
    }

    /// Push a UTF-8 payload as a text frame.
    pub fn send_text(&self, text: impl AsRef<str>) {
        self.send(Frame::Text(Bytes::from(text.as_ref().to_string())));
    }

    /// Close the connection with a close frame carrying `reason`.
    pub fn close(&self, reason: &str) {
        let _ = self.inbound.send(Ok(Frame::close(1000, Bytes::from(reason.to_string()))));
    }

    /// Drop the socket without a close frame (abrupt loss).
    pub fn drop_socket(self) {}
}

/// Broker-side control handle paired with [`MockTransport`].
pub struct MockBroker {
    connections: mpsc::UnboundedReceiver<BrokerConnection>,
}

impl MockBroker {
    /// Wait for the session's next transport connection.
    pub async fn accept(&mut self) -> BrokerConnection {
        self.connections
            .recv()
            .await
            .expect("mock transport dropped")
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<BrokerConnection> {
        tokio::time::timeout(timeout, self.connections.recv())
            .await
            .ok()
            .flatten()
    }
}

pub struct MockReader {
    rx: mpsc::UnboundedReceiver<FrameResult>,
}

impl futures_util::Stream for MockReader {
    type Item = FrameResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

pub struct MockWriter {
    tx: mpsc::UnboundedSender<Frame>,
}

impl Sink<Frame> for MockWriter {
    type Error = ClientError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.get_mut()
            .tx
            .send(item)
            .map_err(|_| ClientError::Transport {
                context: "mock_write",
                error: "broker connection dropped".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Reconnect strategy with a fixed, short delay for deterministic tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedDelay(pub Duration);

impl ReconnectStrategy for FixedDelay {
    fn next_delay(&mut self) -> Duration {
        self.0
    }

    fn reset(&mut self) {}
}

/// Record of one side-channel POST observed by [`MockPoster`].
#[derive(Debug, Clone)]
pub struct PostedRequest {
    pub url: String,
    pub body: Value,
}

type PostScript = Box<dyn FnMut(&str, &Value) -> ClientResult<Value> + Send>;

/// Scripted HTTP side-channel. Responds from the installed script and records
/// every request for assertions.
#[derive(Clone)]
pub struct MockPoster {
    inner: Arc<StdMutex<MockPosterInner>>,
}

struct MockPosterInner {
    script: PostScript,
    requests: Vec<PostedRequest>,
}

impl MockPoster {
    pub fn new(script: impl FnMut(&str, &Value) -> ClientResult<Value> + Send + 'static) -> Self {
        Self {
            inner: Arc::new(StdMutex::new(MockPosterInner {
                script: Box::new(script),
                requests: Vec::new(),
            })),
        }
    }

    /// Poster that fails every request; for tests without side-channels.
    pub fn unreachable() -> Self {
        Self::new(|url, _| Err(ClientError::Http(format!("unexpected POST to {url}"))))
    }

    pub fn requests(&self) -> Vec<PostedRequest> {
        self.inner.lock().expect("poster lock").requests.clone()
    }
}

/// Decode a JSON-dialect outbound frame into its command objects.
pub fn frame_commands(frame: &Frame) -> Vec<Value> {
    let bytes = crate::core::frame_bytes(frame).expect("payload frame");
    sonic_rs::from_slice(bytes).expect("json command frame")
}

/// `id` of a command object (0 when absent).
pub fn command_id(command: &Value) -> u32 {
    use sonic_rs::JsonValueTrait;
    command.get("id").and_then(|v| v.as_u64()).unwrap_or(0) as u32
}

/// `method` of a command object.
pub fn command_method(command: &Value) -> String {
    use sonic_rs::JsonValueTrait;
    command
        .get("method")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

impl HttpPoster for MockPoster {
    fn post_json(
        &self,
        url: String,
        _headers: HashMap<String, String>,
        _params: HashMap<String, String>,
        body: Value,
    ) -> BoxFuture<'static, ClientResult<Value>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut inner = inner.lock().expect("poster lock");
            inner.requests.push(PostedRequest {
                url: url.clone(),
                body: body.clone(),
            });
            (inner.script)(&url, &body)
        })
    }
}
