use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{ClientError, Frame};
use crate::core::types::ClientResult;

pub mod polling;
pub mod tungstenite;

pub type TransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), ClientError>> + Send>>;

/// Transport boundary.
///
/// A transport produces a reader stream and a writer sink of [`Frame`]s; the
/// session owns connection state and policies on top. The trait is minimal so
/// implementations can be swapped (native websocket, polling fallback, or an
/// in-memory mock in tests) without touching session logic.
pub trait Transport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<Frame, ClientError>> + Send + Unpin + 'static;
    type Writer: Sink<Frame, Error = ClientError> + Send + Sync + Unpin + 'static;

    /// Stable flavor label surfaced in the session `connect` event.
    fn name(&self) -> &'static str;

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer>;
}

pub type BoxReader = Pin<Box<dyn Stream<Item = Result<Frame, ClientError>> + Send>>;
pub type BoxWriter = Pin<Box<dyn Sink<Frame, Error = ClientError> + Send + Sync>>;

/// Transport picked from the connection URL scheme: `ws`/`wss` use the native
/// message socket, `http`/`https` fall back to the polling socket. Anything
/// else fails fast.
#[derive(Clone)]
pub enum ServerTransport {
    WebSocket(tungstenite::WebSocketTransport),
    Polling(polling::PollingTransport),
}

impl ServerTransport {
    pub fn for_url(url: &str) -> ClientResult<Self> {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            Ok(Self::WebSocket(tungstenite::WebSocketTransport::default()))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Self::Polling(polling::PollingTransport::default()))
        } else {
            Err(ClientError::TransportUnavailable(url.to_string()))
        }
    }
}

impl Transport for ServerTransport {
    type Reader = BoxReader;
    type Writer = BoxWriter;

    fn name(&self) -> &'static str {
        match self {
            Self::WebSocket(transport) => transport.name(),
            Self::Polling(transport) => transport.name(),
        }
    }

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        match self {
            Self::WebSocket(transport) => {
                let transport = transport.clone();
                Box::pin(async move {
                    let (reader, writer) = transport.connect(url).await?;
                    Ok((Box::pin(reader) as BoxReader, Box::pin(writer) as BoxWriter))
                })
            }
            Self::Polling(transport) => {
                let transport = transport.clone();
                Box::pin(async move {
                    let (reader, writer) = transport.connect(url).await?;
                    Ok((Box::pin(reader) as BoxReader, Box::pin(writer) as BoxWriter))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selects_the_socket_flavor() {
        assert!(matches!(
            ServerTransport::for_url("ws://localhost:8000/connection/websocket"),
            Ok(ServerTransport::WebSocket(_))
        ));
        assert!(matches!(
            ServerTransport::for_url("wss://broker/connection/websocket"),
            Ok(ServerTransport::WebSocket(_))
        ));
        assert!(matches!(
            ServerTransport::for_url("https://broker/connection/sockjs"),
            Ok(ServerTransport::Polling(_))
        ));
        assert!(matches!(
            ServerTransport::for_url("ftp://nope"),
            Err(ClientError::TransportUnavailable(_))
        ));
    }
}
