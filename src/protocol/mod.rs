//! Dialect-neutral protocol records.
//!
//! Commands, replies and pushes are modeled once; the JSON and binary codecs
//! translate them to their wire dialects. User payloads (`data`, `info`) are
//! JSON values in both dialects — the binary codec carries them as raw JSON
//! bytes inside its frames.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use sonic_rs::Value;

pub mod binary;
pub mod codec;
pub mod json;

pub use codec::{Codec, codec_for_url};

/// Command methods understood by the broker.
///
/// The zero/default value is `Connect`: the first outbound command after a
/// transport open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Connect,
    Refresh,
    Subscribe,
    Unsubscribe,
    Publish,
    Presence,
    History,
    Ping,
    Rpc,
    Send,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Connect => "connect",
            Method::Refresh => "refresh",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Publish => "publish",
            Method::Presence => "presence",
            Method::History => "history",
            Method::Ping => "ping",
            Method::Rpc => "rpc",
            Method::Send => "send",
        }
    }
}

/// Server-initiated push kinds. The zero/default value is `Publication`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PushKind {
    #[default]
    Publication,
    Join,
    Leave,
    Unsub,
    Message,
}

/// Opaque connection credentials issued out of band and merged on refresh.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub exp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(default)]
    pub sign: String,
}

/// Wire error shape. A reply error is significant when the code is non-zero
/// or the message is non-empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    #[inline]
    pub fn is_set(&self) -> bool {
        self.code != 0 || !self.message.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ConnectParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RefreshParams {
    pub credentials: Credentials,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SubscribeParams {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recover: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UnsubscribeParams {
    pub channel: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublishParams {
    pub channel: String,
    pub data: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct PresenceParams {
    pub channel: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct HistoryParams {
    pub channel: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct RpcParams {
    pub data: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct SendParams {
    pub data: Value,
}

/// Typed command parameters; the variant fixes the method.
#[derive(Clone, Debug)]
pub enum Params {
    Connect(ConnectParams),
    Refresh(RefreshParams),
    Subscribe(SubscribeParams),
    Unsubscribe(UnsubscribeParams),
    Publish(PublishParams),
    Presence(PresenceParams),
    History(HistoryParams),
    Ping,
    Rpc(RpcParams),
    Send(SendParams),
}

impl Params {
    pub fn method(&self) -> Method {
        match self {
            Params::Connect(_) => Method::Connect,
            Params::Refresh(_) => Method::Refresh,
            Params::Subscribe(_) => Method::Subscribe,
            Params::Unsubscribe(_) => Method::Unsubscribe,
            Params::Publish(_) => Method::Publish,
            Params::Presence(_) => Method::Presence,
            Params::History(_) => Method::History,
            Params::Ping => Method::Ping,
            Params::Rpc(_) => Method::Rpc,
            Params::Send(_) => Method::Send,
        }
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Params::Connect(p) => p.serialize(serializer),
            Params::Refresh(p) => p.serialize(serializer),
            Params::Subscribe(p) => p.serialize(serializer),
            Params::Unsubscribe(p) => p.serialize(serializer),
            Params::Publish(p) => p.serialize(serializer),
            Params::Presence(p) => p.serialize(serializer),
            Params::History(p) => p.serialize(serializer),
            Params::Ping => serde::ser::SerializeMap::end(serializer.serialize_map(Some(0))?),
            Params::Rpc(p) => p.serialize(serializer),
            Params::Send(p) => p.serialize(serializer),
        }
    }
}

/// Outbound command. `id` 0 means "no reply expected" (`Send` only).
#[derive(Clone, Debug)]
pub struct Command {
    pub id: u32,
    pub params: Params,
}

impl Command {
    pub fn new(id: u32, params: Params) -> Self {
        Self { id, params }
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.params.method()
    }
}

/// Raw, dialect-specific payload carried inside replies and pushes.
#[derive(Clone, Debug)]
pub enum RawPayload {
    Json(Value),
    Proto(Bytes),
}

/// Inbound correlated reply. `id` 0 marks a server push carried in `result`.
#[derive(Clone, Debug)]
pub struct Reply {
    pub id: u32,
    pub error: Option<ErrorInfo>,
    pub result: Option<RawPayload>,
}

impl Reply {
    /// Significant error carried by this reply, if any.
    pub fn take_error(&mut self) -> Option<ErrorInfo> {
        match self.error.take() {
            Some(err) if err.is_set() => Some(err),
            _ => None,
        }
    }
}

/// Decoded push envelope; `data` is decoded per kind via the codec.
#[derive(Clone, Debug)]
pub struct RawPush {
    pub kind: PushKind,
    pub channel: String,
    pub data: RawPayload,
}

/// A channel publication carrying a recovery UID.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
}

/// Presence / join / leave member descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub client: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectResult {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub expired: bool,
    /// Credential lifetime in seconds; meaningful when `expires` is set.
    #[serde(default)]
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubscribeResult {
    #[serde(default)]
    pub publications: Option<Vec<Publication>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    #[serde(default)]
    pub recovered: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PresenceResult {
    #[serde(default)]
    pub data: HashMap<String, ClientInfo>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryResult {
    #[serde(default)]
    pub data: Vec<Publication>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RpcResult {
    #[serde(default)]
    pub data: Value,
}

/// Typed result of a completed command, produced by `Codec::decode_command_result`.
#[derive(Clone, Debug)]
pub enum CommandResult {
    Connect(ConnectResult),
    Refresh(ConnectResult),
    Subscribe(SubscribeResult),
    Unsubscribe,
    Publish,
    Presence(PresenceResult),
    History(HistoryResult),
    Ping,
    Rpc(RpcResult),
    Send,
}

/// Typed push payload, produced by `Codec::decode_push_data`.
#[derive(Clone, Debug)]
pub enum PushData {
    Publication(Publication),
    Join(ClientInfo),
    Leave(ClientInfo),
    Unsub,
    Message(Value),
}
