//! Client runtime for a real-time pub/sub and RPC broker protocol.
//!
//! The session multiplexes channel subscriptions and request/response calls
//! over one websocket (or polling fallback) connection, and survives
//! transport loss with resubscription, publication recovery and credential
//! refresh.

pub mod client;
pub mod core;
pub mod http;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod tls;
pub mod transport;

pub use crate::client::{Client, Subscription};
pub use crate::core::backoff::{DecorrelatedJitter, ReconnectStrategy};
pub use crate::core::config::{AuthContext, Config, RefreshContext};
pub use crate::core::frame::{CloseFrame, Frame};
pub use crate::core::types::{ClientError, ClientResult, DisconnectDirective, Status};
pub use crate::protocol::{ClientInfo, Credentials, ErrorInfo, Publication};
pub use crate::session::subscription::{SubState, SubscriptionEvents};
pub use crate::session::{ConnectEvent, DisconnectEvent, SessionEvents, StateSnapshot};
