//! Binary wire dialect.
//!
//! Frames are varint length-delimited protobuf records; a frame carries one
//! or more commands (outbound) or replies (inbound) back to back. User
//! payloads stay raw JSON bytes inside `bytes` fields so both dialects share
//! the in-memory model.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use prost::Message;
use sonic_rs::Value;

use crate::core::types::{ClientError, ClientResult};

use super::codec::{Codec, decode_error};
use super::{
    ClientInfo, Command, CommandResult, ConnectResult, ErrorInfo, HistoryResult, Method, Params,
    PresenceResult, Publication, PushData, PushKind, RawPayload, RawPush, Reply, RpcResult,
    SubscribeResult,
};

pub struct BinaryCodec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
enum MethodProto {
    Connect = 0,
    Refresh = 1,
    Subscribe = 2,
    Unsubscribe = 3,
    Publish = 4,
    Presence = 5,
    History = 6,
    Ping = 7,
    Rpc = 8,
    Send = 9,
}

impl From<Method> for MethodProto {
    fn from(method: Method) -> Self {
        match method {
            Method::Connect => MethodProto::Connect,
            Method::Refresh => MethodProto::Refresh,
            Method::Subscribe => MethodProto::Subscribe,
            Method::Unsubscribe => MethodProto::Unsubscribe,
            Method::Publish => MethodProto::Publish,
            Method::Presence => MethodProto::Presence,
            Method::History => MethodProto::History,
            Method::Ping => MethodProto::Ping,
            Method::Rpc => MethodProto::Rpc,
            Method::Send => MethodProto::Send,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
enum PushKindProto {
    Publication = 0,
    Join = 1,
    Leave = 2,
    Unsub = 3,
    Message = 4,
}

#[derive(Clone, PartialEq, Message)]
struct CommandProto {
    #[prost(uint32, tag = "1")]
    id: u32,
    #[prost(enumeration = "MethodProto", tag = "2")]
    method: i32,
    #[prost(bytes = "vec", tag = "3")]
    params: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct ErrorProto {
    #[prost(uint32, tag = "1")]
    code: u32,
    #[prost(string, tag = "2")]
    message: String,
}

#[derive(Clone, PartialEq, Message)]
struct ReplyProto {
    #[prost(uint32, tag = "1")]
    id: u32,
    #[prost(message, optional, tag = "2")]
    error: Option<ErrorProto>,
    #[prost(bytes = "vec", tag = "3")]
    result: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct CredentialsProto {
    #[prost(string, tag = "1")]
    user: String,
    #[prost(string, tag = "2")]
    exp: String,
    #[prost(bytes = "vec", tag = "3")]
    info: Vec<u8>,
    #[prost(string, tag = "4")]
    sign: String,
}

#[derive(Clone, PartialEq, Message)]
struct ConnectRequestProto {
    #[prost(message, optional, tag = "1")]
    credentials: Option<CredentialsProto>,
    #[prost(bytes = "vec", tag = "2")]
    data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct RefreshRequestProto {
    #[prost(message, optional, tag = "1")]
    credentials: Option<CredentialsProto>,
}

#[derive(Clone, PartialEq, Message)]
struct SubscribeRequestProto {
    #[prost(string, tag = "1")]
    channel: String,
    #[prost(string, optional, tag = "2")]
    client: Option<String>,
    #[prost(bytes = "vec", tag = "3")]
    info: Vec<u8>,
    #[prost(string, optional, tag = "4")]
    sign: Option<String>,
    #[prost(bool, tag = "5")]
    recover: bool,
    #[prost(string, optional, tag = "6")]
    last: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
struct ChannelRequestProto {
    #[prost(string, tag = "1")]
    channel: String,
}

#[derive(Clone, PartialEq, Message)]
struct PublishRequestProto {
    #[prost(string, tag = "1")]
    channel: String,
    #[prost(bytes = "vec", tag = "2")]
    data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct DataRequestProto {
    #[prost(bytes = "vec", tag = "1")]
    data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct PingRequestProto {}

#[derive(Clone, PartialEq, Message)]
struct ConnectResultProto {
    #[prost(string, tag = "1")]
    client: String,
    #[prost(bool, tag = "2")]
    expires: bool,
    #[prost(bool, tag = "3")]
    expired: bool,
    #[prost(uint64, tag = "4")]
    ttl: u64,
    #[prost(bytes = "vec", tag = "5")]
    data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct ClientInfoProto {
    #[prost(string, tag = "1")]
    user: String,
    #[prost(string, tag = "2")]
    client: String,
    #[prost(bytes = "vec", tag = "3")]
    info: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct PublicationProto {
    #[prost(string, tag = "1")]
    uid: String,
    #[prost(bytes = "vec", tag = "2")]
    data: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    info: Option<ClientInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
struct SubscribeResultProto {
    #[prost(message, repeated, tag = "1")]
    publications: Vec<PublicationProto>,
    #[prost(string, optional, tag = "2")]
    last: Option<String>,
    #[prost(bool, tag = "3")]
    recovered: bool,
}

#[derive(Clone, PartialEq, Message)]
struct PresenceResultProto {
    #[prost(map = "string, message", tag = "1")]
    data: HashMap<String, ClientInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
struct HistoryResultProto {
    #[prost(message, repeated, tag = "1")]
    data: Vec<PublicationProto>,
}

#[derive(Clone, PartialEq, Message)]
struct RpcResultProto {
    #[prost(bytes = "vec", tag = "1")]
    data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct PushProto {
    #[prost(enumeration = "PushKindProto", tag = "1")]
    kind: i32,
    #[prost(string, tag = "2")]
    channel: String,
    #[prost(bytes = "vec", tag = "3")]
    data: Vec<u8>,
}

fn value_bytes(value: &Value) -> ClientResult<Vec<u8>> {
    sonic_rs::to_vec(value).map_err(|e| decode_error("encode payload", e))
}

fn opt_value_bytes(value: Option<&Value>) -> ClientResult<Vec<u8>> {
    value.map(value_bytes).transpose().map(Option::unwrap_or_default)
}

fn bytes_value(bytes: &[u8], context: &str) -> ClientResult<Value> {
    if bytes.is_empty() {
        return Ok(Value::default());
    }
    sonic_rs::from_slice(bytes).map_err(|e| decode_error(context, e))
}

fn opt_bytes_value(bytes: &[u8], context: &str) -> ClientResult<Option<Value>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    bytes_value(bytes, context).map(Some)
}

fn credentials_proto(cred: &super::Credentials) -> ClientResult<CredentialsProto> {
    Ok(CredentialsProto {
        user: cred.user.clone(),
        exp: cred.exp.clone(),
        info: opt_value_bytes(cred.info.as_ref())?,
        sign: cred.sign.clone(),
    })
}

fn client_info(proto: ClientInfoProto, context: &str) -> ClientResult<ClientInfo> {
    Ok(ClientInfo {
        info: opt_bytes_value(&proto.info, context)?,
        user: proto.user,
        client: proto.client,
    })
}

fn publication(proto: PublicationProto) -> ClientResult<Publication> {
    Ok(Publication {
        data: bytes_value(&proto.data, "publication data")?,
        info: proto
            .info
            .map(|info| client_info(info, "publication info"))
            .transpose()?,
        uid: proto.uid,
    })
}

fn encode_params(params: &Params) -> ClientResult<Vec<u8>> {
    let bytes = match params {
        Params::Connect(p) => ConnectRequestProto {
            credentials: p.credentials.as_ref().map(credentials_proto).transpose()?,
            data: opt_value_bytes(p.data.as_ref())?,
        }
        .encode_to_vec(),
        Params::Refresh(p) => RefreshRequestProto {
            credentials: Some(credentials_proto(&p.credentials)?),
        }
        .encode_to_vec(),
        Params::Subscribe(p) => SubscribeRequestProto {
            channel: p.channel.clone(),
            client: p.client.clone(),
            info: opt_value_bytes(p.info.as_ref())?,
            sign: p.sign.clone(),
            recover: p.recover.unwrap_or(false),
            last: p.last.clone(),
        }
        .encode_to_vec(),
        Params::Unsubscribe(p) => ChannelRequestProto {
            channel: p.channel.clone(),
        }
        .encode_to_vec(),
        Params::Publish(p) => PublishRequestProto {
            channel: p.channel.clone(),
            data: value_bytes(&p.data)?,
        }
        .encode_to_vec(),
        Params::Presence(p) => ChannelRequestProto {
            channel: p.channel.clone(),
        }
        .encode_to_vec(),
        Params::History(p) => ChannelRequestProto {
            channel: p.channel.clone(),
        }
        .encode_to_vec(),
        Params::Ping => PingRequestProto {}.encode_to_vec(),
        Params::Rpc(p) => DataRequestProto {
            data: value_bytes(&p.data)?,
        }
        .encode_to_vec(),
        Params::Send(p) => DataRequestProto {
            data: value_bytes(&p.data)?,
        }
        .encode_to_vec(),
    };
    Ok(bytes)
}

fn proto_payload<'a>(raw: &'a RawPayload, context: &str) -> ClientResult<&'a [u8]> {
    match raw {
        RawPayload::Proto(bytes) => Ok(bytes.as_ref()),
        RawPayload::Json(_) => Err(ClientError::Codec(format!(
            "{context}: json payload handed to binary codec"
        ))),
    }
}

fn connect_result(proto: ConnectResultProto) -> ClientResult<ConnectResult> {
    Ok(ConnectResult {
        data: opt_bytes_value(&proto.data, "connect data")?,
        client: proto.client,
        expires: proto.expires,
        expired: proto.expired,
        ttl: proto.ttl,
    })
}

impl Codec for BinaryCodec {
    fn name(&self) -> &'static str {
        "protobuf"
    }

    fn binary_frames(&self) -> bool {
        true
    }

    fn encode_commands(&self, commands: &[Command]) -> ClientResult<Bytes> {
        let mut buf = BytesMut::new();
        for command in commands {
            let proto = CommandProto {
                id: command.id,
                method: MethodProto::from(command.method()) as i32,
                params: encode_params(&command.params)?,
            };
            proto
                .encode_length_delimited(&mut buf)
                .map_err(|e| decode_error("encode commands", e))?;
        }
        Ok(buf.freeze())
    }

    fn decode_replies(&self, frame: &[u8]) -> ClientResult<Vec<Reply>> {
        let mut buf = frame;
        let mut replies = Vec::new();
        while buf.has_remaining() {
            let proto = ReplyProto::decode_length_delimited(&mut buf)
                .map_err(|e| decode_error("decode replies", e))?;
            replies.push(Reply {
                id: proto.id,
                error: proto.error.map(|e| ErrorInfo {
                    code: e.code,
                    message: e.message,
                }),
                result: (!proto.result.is_empty())
                    .then(|| RawPayload::Proto(Bytes::from(proto.result))),
            });
        }
        Ok(replies)
    }

    fn decode_command_result(
        &self,
        method: Method,
        raw: &RawPayload,
    ) -> ClientResult<CommandResult> {
        let bytes = proto_payload(raw, "decode result")?;
        Ok(match method {
            Method::Connect => {
                let proto = ConnectResultProto::decode(bytes)
                    .map_err(|e| decode_error("connect result", e))?;
                CommandResult::Connect(connect_result(proto)?)
            }
            Method::Refresh => {
                let proto = ConnectResultProto::decode(bytes)
                    .map_err(|e| decode_error("refresh result", e))?;
                CommandResult::Refresh(connect_result(proto)?)
            }
            Method::Subscribe => {
                let proto = SubscribeResultProto::decode(bytes)
                    .map_err(|e| decode_error("subscribe result", e))?;
                let publications = proto
                    .publications
                    .into_iter()
                    .map(publication)
                    .collect::<ClientResult<Vec<_>>>()?;
                CommandResult::Subscribe(SubscribeResult {
                    publications: (!publications.is_empty()).then_some(publications),
                    last: proto.last,
                    recovered: proto.recovered,
                })
            }
            Method::Unsubscribe => CommandResult::Unsubscribe,
            Method::Publish => CommandResult::Publish,
            Method::Presence => {
                let proto = PresenceResultProto::decode(bytes)
                    .map_err(|e| decode_error("presence result", e))?;
                let mut data = HashMap::with_capacity(proto.data.len());
                for (client, info) in proto.data {
                    data.insert(client, client_info(info, "presence info")?);
                }
                CommandResult::Presence(PresenceResult { data })
            }
            Method::History => {
                let proto = HistoryResultProto::decode(bytes)
                    .map_err(|e| decode_error("history result", e))?;
                CommandResult::History(HistoryResult {
                    data: proto
                        .data
                        .into_iter()
                        .map(publication)
                        .collect::<ClientResult<Vec<_>>>()?,
                })
            }
            Method::Ping => CommandResult::Ping,
            Method::Rpc => {
                let proto =
                    RpcResultProto::decode(bytes).map_err(|e| decode_error("rpc result", e))?;
                CommandResult::Rpc(RpcResult {
                    data: bytes_value(&proto.data, "rpc data")?,
                })
            }
            Method::Send => CommandResult::Send,
        })
    }

    fn decode_push(&self, raw: &RawPayload) -> ClientResult<RawPush> {
        let bytes = proto_payload(raw, "decode push")?;
        let proto = PushProto::decode(bytes).map_err(|e| decode_error("push envelope", e))?;
        let kind = match PushKindProto::try_from(proto.kind)
            .map_err(|e| decode_error("push kind", e))?
        {
            PushKindProto::Publication => PushKind::Publication,
            PushKindProto::Join => PushKind::Join,
            PushKindProto::Leave => PushKind::Leave,
            PushKindProto::Unsub => PushKind::Unsub,
            PushKindProto::Message => PushKind::Message,
        };
        Ok(RawPush {
            kind,
            channel: proto.channel,
            data: RawPayload::Proto(Bytes::from(proto.data)),
        })
    }

    fn decode_push_data(&self, kind: PushKind, raw: &RawPayload) -> ClientResult<PushData> {
        let bytes = proto_payload(raw, "decode push data")?;
        Ok(match kind {
            PushKind::Publication => {
                let proto = PublicationProto::decode(bytes)
                    .map_err(|e| decode_error("publication", e))?;
                PushData::Publication(publication(proto)?)
            }
            PushKind::Join => {
                let proto =
                    ClientInfoProto::decode(bytes).map_err(|e| decode_error("join", e))?;
                PushData::Join(client_info(proto, "join info")?)
            }
            PushKind::Leave => {
                let proto =
                    ClientInfoProto::decode(bytes).map_err(|e| decode_error("leave", e))?;
                PushData::Leave(client_info(proto, "leave info")?)
            }
            PushKind::Unsub => PushData::Unsub,
            PushKind::Message => PushData::Message(bytes_value(bytes, "message push")?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RpcParams, SubscribeParams};

    #[test]
    fn frames_round_trip_length_delimited_records() {
        let codec = BinaryCodec;
        let commands = vec![
            Command::new(
                1,
                Params::Subscribe(SubscribeParams {
                    channel: "news".to_string(),
                    recover: Some(true),
                    last: Some("u7".to_string()),
                    ..Default::default()
                }),
            ),
            Command::new(
                2,
                Params::Rpc(RpcParams {
                    data: sonic_rs::from_str("{\"op\":\"echo\"}").unwrap(),
                }),
            ),
        ];
        let frame = codec.encode_commands(&commands).unwrap();

        let mut buf = frame.as_ref();
        let first = CommandProto::decode_length_delimited(&mut buf).unwrap();
        let second = CommandProto::decode_length_delimited(&mut buf).unwrap();
        assert!(!buf.has_remaining());

        assert_eq!(first.id, 1);
        assert_eq!(first.method, MethodProto::Subscribe as i32);
        let sub = SubscribeRequestProto::decode(first.params.as_slice()).unwrap();
        assert_eq!(sub.channel, "news");
        assert!(sub.recover);
        assert_eq!(sub.last.as_deref(), Some("u7"));

        assert_eq!(second.id, 2);
        assert_eq!(second.method, MethodProto::Rpc as i32);
    }

    #[test]
    fn replies_and_pushes_decode_from_one_frame() {
        let mut buf = BytesMut::new();
        ReplyProto {
            id: 3,
            error: None,
            result: SubscribeResultProto {
                publications: vec![PublicationProto {
                    uid: "u9".to_string(),
                    data: b"{\"n\":9}".to_vec(),
                    info: None,
                }],
                last: None,
                recovered: true,
            }
            .encode_to_vec(),
        }
        .encode_length_delimited(&mut buf)
        .unwrap();
        ReplyProto {
            id: 0,
            error: None,
            result: PushProto {
                kind: PushKindProto::Join as i32,
                channel: "room".to_string(),
                data: ClientInfoProto {
                    user: "u".to_string(),
                    client: "c".to_string(),
                    info: Vec::new(),
                }
                .encode_to_vec(),
            }
            .encode_to_vec(),
        }
        .encode_length_delimited(&mut buf)
        .unwrap();

        let codec = BinaryCodec;
        let replies = codec.decode_replies(&buf.freeze()).unwrap();
        assert_eq!(replies.len(), 2);

        match codec
            .decode_command_result(Method::Subscribe, replies[0].result.as_ref().unwrap())
            .unwrap()
        {
            CommandResult::Subscribe(res) => {
                assert!(res.recovered);
                assert_eq!(res.publications.unwrap()[0].uid, "u9");
            }
            other => panic!("expected subscribe result, got {other:?}"),
        }

        let push = codec.decode_push(replies[1].result.as_ref().unwrap()).unwrap();
        assert_eq!(push.kind, PushKind::Join);
        assert_eq!(push.channel, "room");
        match codec.decode_push_data(push.kind, &push.data).unwrap() {
            PushData::Join(info) => assert_eq!(info.user, "u"),
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn method_zero_value_is_connect() {
        let proto = CommandProto {
            id: 1,
            method: 0,
            params: Vec::new(),
        };
        assert_eq!(
            MethodProto::try_from(proto.method).unwrap(),
            MethodProto::Connect
        );
    }
}
