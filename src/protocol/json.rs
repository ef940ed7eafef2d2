//! JSON wire dialect.
//!
//! A frame is a JSON array of command objects; inbound frames are either an
//! array of replies or a single reply object.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sonic_rs::Value;

use crate::core::types::{ClientError, ClientResult};

use super::codec::{Codec, decode_error};
use super::{
    Command, CommandResult, ErrorInfo, Method, Params, PushData, PushKind, RawPayload, RawPush,
    Reply,
};

pub struct JsonCodec;

#[derive(Serialize)]
struct WireCommand<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    method: &'static str,
    params: &'a Params,
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(default)]
    id: u32,
    #[serde(default)]
    error: Option<ErrorInfo>,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Deserialize)]
struct WirePush {
    #[serde(default, rename = "type")]
    kind: u32,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: Value,
}

fn from_json<T: DeserializeOwned>(value: &Value, context: &str) -> ClientResult<T> {
    // Value -> bytes -> T keeps us off any Value-specific deserializer API.
    let bytes = sonic_rs::to_vec(value).map_err(|e| decode_error(context, e))?;
    sonic_rs::from_slice(&bytes).map_err(|e| decode_error(context, e))
}

fn json_payload<'a>(raw: &'a RawPayload, context: &str) -> ClientResult<&'a Value> {
    match raw {
        RawPayload::Json(value) => Ok(value),
        RawPayload::Proto(_) => Err(ClientError::Codec(format!(
            "{context}: binary payload handed to json codec"
        ))),
    }
}

fn push_kind(raw: u32) -> PushKind {
    match raw {
        1 => PushKind::Join,
        2 => PushKind::Leave,
        3 => PushKind::Unsub,
        4 => PushKind::Message,
        _ => PushKind::Publication,
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn binary_frames(&self) -> bool {
        false
    }

    fn encode_commands(&self, commands: &[Command]) -> ClientResult<Bytes> {
        let wire: Vec<WireCommand<'_>> = commands
            .iter()
            .map(|cmd| WireCommand {
                id: (cmd.id != 0).then_some(cmd.id),
                method: cmd.method().as_str(),
                params: &cmd.params,
            })
            .collect();
        let bytes = sonic_rs::to_vec(&wire).map_err(|e| decode_error("encode commands", e))?;
        Ok(Bytes::from(bytes))
    }

    fn decode_replies(&self, frame: &[u8]) -> ClientResult<Vec<Reply>> {
        let wire: Vec<WireReply> = match sonic_rs::from_slice::<Vec<WireReply>>(frame) {
            Ok(replies) => replies,
            Err(_) => {
                let single: WireReply = sonic_rs::from_slice(frame)
                    .map_err(|e| decode_error("decode replies", e))?;
                vec![single]
            }
        };
        Ok(wire
            .into_iter()
            .map(|reply| Reply {
                id: reply.id,
                error: reply.error,
                result: reply.result.map(RawPayload::Json),
            })
            .collect())
    }

    fn decode_command_result(
        &self,
        method: Method,
        raw: &RawPayload,
    ) -> ClientResult<CommandResult> {
        let value = json_payload(raw, "decode result")?;
        Ok(match method {
            Method::Connect => CommandResult::Connect(from_json(value, "connect result")?),
            Method::Refresh => CommandResult::Refresh(from_json(value, "refresh result")?),
            Method::Subscribe => CommandResult::Subscribe(from_json(value, "subscribe result")?),
            Method::Unsubscribe => CommandResult::Unsubscribe,
            Method::Publish => CommandResult::Publish,
            Method::Presence => CommandResult::Presence(from_json(value, "presence result")?),
            Method::History => CommandResult::History(from_json(value, "history result")?),
            Method::Ping => CommandResult::Ping,
            Method::Rpc => CommandResult::Rpc(from_json(value, "rpc result")?),
            Method::Send => CommandResult::Send,
        })
    }

    fn decode_push(&self, raw: &RawPayload) -> ClientResult<RawPush> {
        let value = json_payload(raw, "decode push")?;
        let push: WirePush = from_json(value, "push envelope")?;
        Ok(RawPush {
            kind: push_kind(push.kind),
            channel: push.channel,
            data: RawPayload::Json(push.data),
        })
    }

    fn decode_push_data(&self, kind: PushKind, raw: &RawPayload) -> ClientResult<PushData> {
        let value = json_payload(raw, "decode push data")?;
        Ok(match kind {
            PushKind::Publication => PushData::Publication(from_json(value, "publication")?),
            PushKind::Join => PushData::Join(from_json(value, "join")?),
            PushKind::Leave => PushData::Leave(from_json(value, "leave")?),
            PushKind::Unsub => PushData::Unsub,
            PushKind::Message => PushData::Message(value.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcParams;

    fn rpc_command(id: u32) -> Command {
        Command::new(
            id,
            Params::Rpc(RpcParams {
                data: sonic_rs::from_str("{\"op\":\"echo\"}").unwrap(),
            }),
        )
    }

    #[test]
    fn commands_encode_as_an_array_in_insertion_order() {
        let codec = JsonCodec;
        let frame = codec
            .encode_commands(&[rpc_command(1), rpc_command(2)])
            .unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with('['));
        let first = text.find("\"id\":1").unwrap();
        let second = text.find("\"id\":2").unwrap();
        assert!(first < second);
        assert!(text.contains("\"method\":\"rpc\""));
        assert!(text.contains("\"op\":\"echo\""));
    }

    #[test]
    fn fire_and_forget_commands_omit_the_id() {
        let codec = JsonCodec;
        let cmd = Command::new(
            0,
            Params::Send(crate::protocol::SendParams {
                data: sonic_rs::from_str("1").unwrap(),
            }),
        );
        let frame = codec.encode_commands(&[cmd]).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(!text.contains("\"id\""));
        assert!(text.contains("\"method\":\"send\""));
    }

    #[test]
    fn replies_decode_from_array_or_single_object() {
        let codec = JsonCodec;

        let replies = codec
            .decode_replies(br#"[{"id":1,"result":{"client":"abc"}},{"id":2,"error":{"code":102,"message":"nope"}}]"#)
            .unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, 1);
        assert_eq!(replies[1].error.as_ref().unwrap().code, 102);

        let replies = codec
            .decode_replies(br#"{"id":7,"result":{}}"#)
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, 7);
    }

    #[test]
    fn pushes_decode_with_defaulted_kind() {
        let codec = JsonCodec;
        let replies = codec
            .decode_replies(br#"{"result":{"channel":"news","data":{"uid":"u1","data":{"n":1}}}}"#)
            .unwrap();
        let reply = &replies[0];
        assert_eq!(reply.id, 0);

        let push = codec.decode_push(reply.result.as_ref().unwrap()).unwrap();
        assert_eq!(push.kind, PushKind::Publication);
        assert_eq!(push.channel, "news");

        match codec.decode_push_data(push.kind, &push.data).unwrap() {
            PushData::Publication(p) => assert_eq!(p.uid, "u1"),
            other => panic!("expected publication, got {other:?}"),
        }
    }
}
