use sonic_rs::JsonValueTrait;
use thiserror::Error;

/// Convenience result alias for session operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Canonical error surface shared across the runtime.
///
/// Server errors are propagated verbatim as `{code, message}`; client-side
/// failures use the dedicated variants (`Timeout` maps to the wire shape
/// `{code: 0, message: "timeout"}`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("timeout")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("transport unavailable for url {0}")]
    TransportUnavailable(String),

    #[error("credentials expired")]
    Expired,

    #[error("refresh failed: {0}")]
    RefreshFailed(String),

    #[error("authorization request failed")]
    AuthorizationFailed,

    #[error("server error: code={code}, message={message}")]
    Server { code: u32, message: String },

    #[error("bad channel: {0}")]
    BadChannel(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ClientError {
    /// Wire-shaped error code. Client-side failures carry code 0.
    pub fn code(&self) -> u32 {
        match self {
            ClientError::Server { code, .. } => *code,
            _ => 0,
        }
    }

    /// True for a server reply error that should be treated as a client-side
    /// timeout (code 0 with message `timeout`).
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Timeout => true,
            ClientError::Server { code, message } => *code == 0 && message == "timeout",
            _ => false,
        }
    }
}

/// High-level session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
}

/// Parsed close instruction attached to a transport `close` event.
///
/// The broker may close with a JSON object `{"reason": .., "reconnect": ..}`
/// or with a plain string; a plain `"disconnect"` suppresses reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectDirective {
    pub reason: String,
    pub reconnect: bool,
}

impl DisconnectDirective {
    pub fn new(reason: impl Into<String>, reconnect: bool) -> Self {
        Self {
            reason: reason.into(),
            reconnect,
        }
    }

    pub fn from_close_reason(raw: &str) -> Self {
        if let Ok(value) = sonic_rs::from_str::<sonic_rs::Value>(raw)
            && value.is_object()
        {
            let reason = value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or(raw)
                .to_string();
            let reconnect = value.get("reconnect").and_then(|v| v.as_bool()).unwrap_or(false);
            return Self { reason, reconnect };
        }
        Self {
            reason: raw.to_string(),
            reconnect: raw != "disconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_parses_json_directives() {
        let d = DisconnectDirective::from_close_reason("{\"reason\": \"shutdown\", \"reconnect\": true}");
        assert_eq!(d.reason, "shutdown");
        assert!(d.reconnect);

        let d = DisconnectDirective::from_close_reason("{\"reason\": \"banned\", \"reconnect\": false}");
        assert_eq!(d.reason, "banned");
        assert!(!d.reconnect);
    }

    #[test]
    fn close_reason_falls_back_to_plain_strings() {
        let d = DisconnectDirective::from_close_reason("server restart");
        assert_eq!(d.reason, "server restart");
        assert!(d.reconnect);

        let d = DisconnectDirective::from_close_reason("disconnect");
        assert!(!d.reconnect);
    }

    #[test]
    fn server_timeout_errors_count_as_timeouts() {
        assert!(ClientError::Timeout.is_timeout());
        assert!(
            ClientError::Server {
                code: 0,
                message: "timeout".to_string()
            }
            .is_timeout()
        );
        assert!(
            !ClientError::Server {
                code: 103,
                message: "permission denied".to_string()
            }
            .is_timeout()
        );
    }
}
