pub mod actor;
pub mod pending;
pub mod subscription;
pub mod writer;

use std::time::Duration;

use sonic_rs::Value;

use crate::core::types::Status;

/// Payload of the session `connect` event.
#[derive(Debug, Clone)]
pub struct ConnectEvent {
    pub client: String,
    /// Transport flavor that carried the session (`"websocket"`, `"polling"`).
    pub transport: &'static str,
    /// Round trip measured from CONNECT send to its reply.
    pub latency: Duration,
    pub data: Option<Value>,
}

/// Payload of the session `disconnect` event.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub reason: String,
    pub reconnect: bool,
}

/// Session-level handlers. All callbacks run on the session actor.
#[derive(Default)]
pub struct SessionEvents {
    pub on_connect: Option<Box<dyn FnMut(ConnectEvent) + Send>>,
    pub on_disconnect: Option<Box<dyn FnMut(DisconnectEvent) + Send>>,
    /// Server-to-client messages outside any channel.
    pub on_message: Option<Box<dyn FnMut(Value) + Send>>,
    /// Refresh attempts exhausted; the session is terminally disconnected.
    pub on_refresh_failed: Option<Box<dyn FnMut() + Send>>,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, f: impl FnMut(ConnectEvent) + Send + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl FnMut(DisconnectEvent) + Send + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    pub fn on_message(mut self, f: impl FnMut(Value) + Send + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_refresh_failed(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_refresh_failed = Some(Box::new(f));
        self
    }
}

/// Snapshot of observable session state.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub status: Status,
    pub client_id: Option<String>,
    pub latency: Option<Duration>,
}
