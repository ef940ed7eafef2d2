//! Public facade over the session actor.

use std::sync::Arc;

use kameo::actor::WeakActorRef;
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef};
use sonic_rs::Value;

use crate::core::backoff::ReconnectStrategy;
use crate::core::config::Config;
use crate::core::types::{ClientError, ClientResult, Status};
use crate::http::{HttpPoster, ReqwestPoster};
use crate::protocol::{
    Codec, CommandResult, Credentials, HistoryParams, HistoryResult, Params, PresenceParams,
    PresenceResult, PublishParams, RpcParams, codec_for_url,
};
use crate::session::actor::{
    Call, Fire, GetState, HasSub, SessionActor, SessionArgs, SessionEvent, SubscribeChannel,
    UnsubscribeChannel,
};
use crate::session::subscription::SubscriptionEvents;
use crate::session::{SessionEvents, StateSnapshot};
use crate::transport::{ServerTransport, Transport};

fn map_send<M, T>(result: Result<T, SendError<M, ClientError>>) -> ClientResult<T> {
    result.map_err(|err| match err {
        SendError::HandlerError(err) => err,
        _ => ClientError::InvalidState("session actor unavailable".to_string()),
    })
}

/// Long-lived client session to a broker.
///
/// Cheap to clone; all clones drive the same session actor.
pub struct Client<T: Transport = ServerTransport> {
    actor: ActorRef<SessionActor<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
        }
    }
}

impl Client<ServerTransport> {
    /// Build a client for `url`, selecting transport and codec from the URL
    /// (scheme picks the socket flavor, `format=protobuf` the binary dialect).
    pub fn new(
        url: impl Into<String>,
        config: Config,
        events: SessionEvents,
    ) -> ClientResult<Self> {
        let url = url.into();
        let transport = ServerTransport::for_url(&url)?;
        let codec = codec_for_url(&url);
        Ok(Self::with_parts(
            url,
            config,
            events,
            transport,
            codec,
            Arc::new(ReqwestPoster::default()),
            None,
        ))
    }
}

impl<T: Transport> Client<T> {
    /// Build a client with every collaborator injected; used by tests and by
    /// embedders that bring their own transport or HTTP stack.
    pub fn with_parts(
        url: impl Into<String>,
        config: Config,
        events: SessionEvents,
        transport: T,
        codec: Arc<dyn Codec>,
        http: Arc<dyn HttpPoster>,
        reconnect: Option<Box<dyn ReconnectStrategy>>,
    ) -> Self {
        let actor = SessionActor::spawn(SessionArgs {
            url: url.into(),
            config,
            events,
            transport,
            codec,
            http,
            reconnect,
        });
        Self { actor }
    }

    /// Begin connecting; a no-op when already connecting or connected.
    pub async fn connect(&self) -> ClientResult<()> {
        map_send(self.actor.ask(SessionEvent::Connect).await)
    }

    /// Disconnect and cancel any scheduled reconnect; idempotent.
    pub async fn disconnect(&self) -> ClientResult<()> {
        map_send(self.actor.ask(SessionEvent::Disconnect).await)
    }

    pub async fn state(&self) -> ClientResult<StateSnapshot> {
        map_send(self.actor.ask(GetState).await)
    }

    pub async fn is_connected(&self) -> bool {
        self.state()
            .await
            .map(|state| state.status == Status::Connected)
            .unwrap_or(false)
    }

    pub async fn set_credentials(&self, credentials: Credentials) -> ClientResult<()> {
        map_send(self.actor.ask(SessionEvent::SetCredentials(credentials)).await)
    }

    pub async fn set_connect_data(&self, data: Value) -> ClientResult<()> {
        map_send(self.actor.ask(SessionEvent::SetConnectData(data)).await)
    }

    /// Request/response call; resolves with the decoded RPC reply data.
    pub async fn rpc(&self, data: Value) -> ClientResult<Value> {
        let result = map_send(
            self.actor
                .ask(Call {
                    params: Params::Rpc(RpcParams { data }),
                })
                .await,
        )?;
        match result {
            CommandResult::Rpc(result) => Ok(result.data),
            _ => Err(ClientError::Codec("rpc reply shape mismatch".to_string())),
        }
    }

    /// Fire-and-forget message to the broker; no id, no reply.
    pub async fn send(&self, data: Value) -> ClientResult<()> {
        map_send(self.actor.ask(Fire { data }).await)
    }

    /// Resolves once the PING reply arrives, or with the per-call timeout.
    pub async fn ping(&self) -> ClientResult<()> {
        map_send(
            self.actor
                .ask(Call {
                    params: Params::Ping,
                })
                .await,
        )
        .map(|_| ())
    }

    /// Subscribe to `channel`, reusing (and re-arming) an existing
    /// subscription for the channel if present.
    pub async fn subscribe(
        &self,
        channel: impl Into<String>,
        events: SubscriptionEvents,
    ) -> ClientResult<Subscription<T>> {
        let channel = channel.into();
        map_send(
            self.actor
                .ask(SubscribeChannel {
                    channel: channel.clone(),
                    events: Some(events),
                })
                .await,
        )?;
        Ok(Subscription {
            channel,
            session: self.actor.downgrade(),
        })
    }

    /// Handle for an already-registered channel, if any.
    pub async fn get_sub(&self, channel: &str) -> ClientResult<Option<Subscription<T>>> {
        let present = map_send(
            self.actor
                .ask(HasSub {
                    channel: channel.to_string(),
                })
                .await,
        )?;
        Ok(present.then(|| Subscription {
            channel: channel.to_string(),
            session: self.actor.downgrade(),
        }))
    }

    pub async fn start_batching(&self) -> ClientResult<()> {
        map_send(self.actor.ask(SessionEvent::StartBatching).await)
    }

    pub async fn stop_batching(&self, flush: bool) -> ClientResult<()> {
        map_send(self.actor.ask(SessionEvent::StopBatching { flush }).await)
    }

    pub async fn flush(&self) -> ClientResult<()> {
        map_send(self.actor.ask(SessionEvent::Flush).await)
    }

    pub async fn start_auth_batching(&self) -> ClientResult<()> {
        map_send(self.actor.ask(SessionEvent::StartAuthBatching).await)
    }

    pub async fn stop_auth_batching(&self) -> ClientResult<()> {
        map_send(self.actor.ask(SessionEvent::StopAuthBatching).await)
    }
}

/// Handle to one channel subscription.
///
/// Holds a non-owning reference back to the session; operations fail with
/// `Disconnected` once the session actor is gone.
pub struct Subscription<T: Transport = ServerTransport> {
    channel: String,
    session: WeakActorRef<SessionActor<T>>,
}

impl<T: Transport> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            session: self.session.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

impl<T: Transport> Subscription<T> {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn session(&self) -> ClientResult<ActorRef<SessionActor<T>>> {
        self.session.upgrade().ok_or(ClientError::Disconnected)
    }

    /// Re-arm the subscription after an unsubscribe.
    pub async fn subscribe(&self) -> ClientResult<()> {
        map_send(
            self.session()?
                .ask(SubscribeChannel {
                    channel: self.channel.clone(),
                    events: None,
                })
                .await,
        )
    }

    pub async fn unsubscribe(&self) -> ClientResult<()> {
        map_send(
            self.session()?
                .ask(UnsubscribeChannel {
                    channel: self.channel.clone(),
                })
                .await,
        )
    }

    pub async fn publish(&self, data: Value) -> ClientResult<()> {
        map_send(
            self.session()?
                .ask(Call {
                    params: Params::Publish(PublishParams {
                        channel: self.channel.clone(),
                        data,
                    }),
                })
                .await,
        )
        .map(|_| ())
    }

    pub async fn presence(&self) -> ClientResult<PresenceResult> {
        let result = map_send(
            self.session()?
                .ask(Call {
                    params: Params::Presence(PresenceParams {
                        channel: self.channel.clone(),
                    }),
                })
                .await,
        )?;
        match result {
            CommandResult::Presence(result) => Ok(result),
            _ => Err(ClientError::Codec("presence reply shape mismatch".to_string())),
        }
    }

    pub async fn history(&self) -> ClientResult<HistoryResult> {
        let result = map_send(
            self.session()?
                .ask(Call {
                    params: Params::History(HistoryParams {
                        channel: self.channel.clone(),
                    }),
                })
                .await,
        )?;
        match result {
            CommandResult::History(result) => Ok(result),
            _ => Err(ClientError::Codec("history reply shape mismatch".to_string())),
        }
    }
}
