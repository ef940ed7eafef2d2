use std::sync::Arc;

use bytes::Bytes;

use crate::core::types::{ClientError, ClientResult};

use super::binary::BinaryCodec;
use super::json::JsonCodec;
use super::{Command, CommandResult, Method, PushData, PushKind, RawPayload, RawPush, Reply};

/// Wire dialect boundary.
///
/// A codec turns in-memory command/reply/push records into transport frames
/// and back. The session core is dialect-agnostic; the dialect is picked from
/// the connection URL (`format=protobuf` selects the binary codec).
pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// True when frames must be sent as binary transport messages.
    fn binary_frames(&self) -> bool;

    /// Serialize a non-empty ordered command sequence into one frame.
    fn encode_commands(&self, commands: &[Command]) -> ClientResult<Bytes>;

    /// Parse an inbound frame into replies, preserving wire order.
    fn decode_replies(&self, frame: &[u8]) -> ClientResult<Vec<Reply>>;

    /// Decode the raw result of a completed command into its typed form.
    fn decode_command_result(&self, method: Method, raw: &RawPayload)
    -> ClientResult<CommandResult>;

    /// Decode the push envelope carried by an uncorrelated reply.
    fn decode_push(&self, raw: &RawPayload) -> ClientResult<RawPush>;

    /// Decode a push payload for a known push kind.
    fn decode_push_data(&self, kind: PushKind, raw: &RawPayload) -> ClientResult<PushData>;
}

/// Pick the codec mandated by the connection URL.
pub fn codec_for_url(url: &str) -> Arc<dyn Codec> {
    if url_selects_binary(url) {
        Arc::new(BinaryCodec)
    } else {
        Arc::new(JsonCodec)
    }
}

pub(crate) fn url_selects_binary(url: &str) -> bool {
    let Some((_, query)) = url.split_once('?') else {
        return false;
    };
    query.split('&').any(|pair| pair == "format=protobuf")
}

pub(crate) fn decode_error(context: &str, err: impl std::fmt::Display) -> ClientError {
    ClientError::Codec(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_query_selects_binary_dialect() {
        assert!(url_selects_binary(
            "ws://localhost:8000/connection/websocket?format=protobuf"
        ));
        assert!(url_selects_binary("wss://host/ws?x=1&format=protobuf"));
        assert!(!url_selects_binary("ws://localhost:8000/connection/websocket"));
        assert!(!url_selects_binary("ws://host/ws?format=json"));
    }

    #[test]
    fn codec_selection_follows_url() {
        assert_eq!(codec_for_url("ws://h/ws").name(), "json");
        assert_eq!(codec_for_url("ws://h/ws?format=protobuf").name(), "protobuf");
    }
}
