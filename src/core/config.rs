use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use sonic_rs::Value;

use super::types::{ClientResult, DisconnectDirective};

/// Context handed to a user-supplied refresh override.
#[derive(Debug, Clone)]
pub struct RefreshContext {
    pub data: Value,
}

/// Context handed to a user-supplied private-channel authorization override.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub client: String,
    pub channels: Vec<String>,
}

/// User override for the credential refresh side-channel. Must resolve with the
/// same JSON shape the refresh endpoint would return (`{user, exp, info?, sign}`).
pub type RefreshOverride =
    Arc<dyn Fn(RefreshContext) -> BoxFuture<'static, ClientResult<Value>> + Send + Sync>;

/// User override for the private-channel authorization side-channel. Must
/// resolve with the endpoint shape (`{channel: {status?, info, sign}}`).
pub type AuthOverride =
    Arc<dyn Fn(AuthContext) -> BoxFuture<'static, ClientResult<Value>> + Send + Sync>;

/// Observer invoked on every transport close, before the reconnect decision.
pub type TransportCloseObserver = Arc<dyn Fn(&DisconnectDirective) + Send + Sync>;

/// Session options. Every option has a fixed default; construct with
/// `Config::default()` and override fields as needed.
#[derive(Clone)]
pub struct Config {
    /// Reconnect backoff base.
    pub retry: Duration,
    /// Reconnect backoff cap.
    pub max_retry: Duration,
    /// Per-call reply deadline.
    pub timeout: Duration,
    /// Re-issue SUBSCRIBE commands for surviving channels after reconnect.
    pub resubscribe: bool,
    /// Enable the heartbeat watchdog.
    pub ping: bool,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    /// Channels starting with this prefix require authorization.
    pub private_prefix: String,
    pub refresh_endpoint: String,
    pub refresh_headers: HashMap<String, String>,
    pub refresh_params: HashMap<String, String>,
    /// Application payload POSTed to the refresh endpoint.
    pub refresh_data: Value,
    /// Failure cap: `None` retries forever, `Some(0)` disables refresh.
    pub refresh_attempts: Option<u32>,
    /// Base delay between failed refresh attempts.
    pub refresh_interval: Duration,
    pub auth_endpoint: String,
    pub auth_headers: HashMap<String, String>,
    pub auth_params: HashMap<String, String>,
    pub on_refresh: Option<RefreshOverride>,
    pub on_auth: Option<AuthOverride>,
    pub on_transport_close: Option<TransportCloseObserver>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: Duration::from_millis(1000),
            max_retry: Duration::from_millis(20_000),
            timeout: Duration::from_millis(5000),
            resubscribe: true,
            ping: true,
            ping_interval: Duration::from_millis(30_000),
            pong_wait: Duration::from_millis(5000),
            private_prefix: "$".to_string(),
            refresh_endpoint: "/centrifuge/refresh".to_string(),
            refresh_headers: HashMap::new(),
            refresh_params: HashMap::new(),
            refresh_data: Value::default(),
            refresh_attempts: None,
            refresh_interval: Duration::from_millis(3000),
            auth_endpoint: "/centrifuge/auth".to_string(),
            auth_headers: HashMap::new(),
            auth_params: HashMap::new(),
            on_refresh: None,
            on_auth: None,
            on_transport_close: None,
        }
    }
}

impl Config {
    #[inline]
    pub fn is_private(&self, channel: &str) -> bool {
        channel.starts_with(&self.private_prefix)
    }
}
