//! The session engine.
//!
//! All mutable session state lives in this actor: the command multiplexer,
//! the batching buffers, the subscription registry, the reconnect controller,
//! the refresh loop and the heartbeat watchdog. Timers and IO loops are tokio
//! tasks that message the actor, so every handler runs to completion over a
//! consistent view of the state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use kameo::reply::{DelegatedReply, ReplySender};
use serde::Serialize;
use sonic_rs::{JsonValueTrait, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::backoff::{DecorrelatedJitter, ReconnectStrategy, uniform_jitter};
use crate::core::config::{AuthContext, Config, RefreshContext};
use crate::core::heartbeat::HeartbeatMonitor;
use crate::core::types::{ClientError, ClientResult, DisconnectDirective, Status};
use crate::core::{Frame, frame_bytes, payload_frame};
use crate::http::HttpPoster;
use crate::protocol::{
    Codec, Command, CommandResult, ConnectParams, ConnectResult, Credentials, Method, Params,
    PushData, RawPayload, Reply, SubscribeParams, SubscribeResult, UnsubscribeParams,
};
use crate::transport::Transport;

use super::pending::PendingCalls;
use super::subscription::{SubEntry, SubState, SubscriptionEvents};
use super::writer::{WriteFrame, WriterActor};
use super::{ConnectEvent, DisconnectEvent, SessionEvents, StateSnapshot};

/// Reply continuation registered for an in-flight command.
pub enum Waiter {
    /// External caller blocked on an ask (`rpc`, `ping`, `publish`, ...).
    Caller(ReplySender<ClientResult<CommandResult>>),
    /// Session-internal continuations.
    Connect,
    Refresh,
    Subscribe { channel: String },
    /// Reply is observed for liveness only.
    Ignore,
}

/// Arguments for spawning a session actor.
pub struct SessionArgs<T: Transport> {
    pub url: String,
    pub config: Config,
    pub events: SessionEvents,
    pub transport: T,
    pub codec: Arc<dyn Codec>,
    pub http: Arc<dyn HttpPoster>,
    /// Override the reconnect delay policy (tests pin it deterministic).
    pub reconnect: Option<Box<dyn ReconnectStrategy>>,
}

pub struct SessionActor<T: Transport> {
    url: String,
    config: Config,
    events: SessionEvents,
    transport: T,
    codec: Arc<dyn Codec>,
    http: Arc<dyn HttpPoster>,
    actor_ref: ActorRef<Self>,

    status: Status,
    client_id: Option<String>,
    latency: Option<Duration>,
    credentials: Option<Credentials>,
    connect_data: Option<Value>,
    next_id: u32,

    pending: PendingCalls<Waiter>,
    subs: HashMap<String, SubEntry>,
    last_seen: HashMap<String, String>,

    batching: bool,
    outbound_queue: Vec<Command>,
    auth_batching: bool,
    auth_batch: Vec<String>,

    backoff: Box<dyn ReconnectStrategy>,
    heartbeat: HeartbeatMonitor,

    io_active: bool,
    writer_ref: Option<ActorRef<WriterActor<T::Writer>>>,
    reader_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    user_disconnected: bool,
    disconnect_emitted: bool,
    reconnect_epoch: u64,
    refresh_epoch: u64,
    refresh_in_flight: bool,
    refresh_required: bool,
    refresh_failures: u32,
    expiry_scheduled_at: Option<Instant>,
    connect_sent_at: Option<Instant>,
}

/// Control events processed by the session actor. User-facing entries are
/// asked so callers observe completion; timer and IO entries are told.
#[derive(Debug)]
pub enum SessionEvent {
    Connect,
    Disconnect,
    Inbound(Frame),
    TransportClosed {
        directive: DisconnectDirective,
    },
    DialFailed {
        epoch: u64,
        error: String,
    },
    ReconnectTick {
        epoch: u64,
    },
    ExpirePending,
    EmitPing,
    PongDeadline {
        seq: u64,
    },
    RefreshDue {
        epoch: u64,
    },
    RefreshResolved {
        epoch: u64,
        result: ClientResult<Value>,
    },
    AuthResolved {
        channels: Vec<String>,
        result: ClientResult<Value>,
    },
    SetCredentials(Credentials),
    SetConnectData(Value),
    StartBatching,
    StopBatching {
        flush: bool,
    },
    Flush,
    StartAuthBatching,
    StopAuthBatching,
}

/// Ask: issue a correlated command and await its typed result.
pub struct Call {
    pub params: Params,
}

/// Ask: fire-and-forget `SEND` (no id, no pending entry).
pub struct Fire {
    pub data: Value,
}

/// Ask: create or revive the registry entry for a channel.
pub struct SubscribeChannel {
    pub channel: String,
    pub events: Option<SubscriptionEvents>,
}

/// Ask: user-unsubscribe a channel.
pub struct UnsubscribeChannel {
    pub channel: String,
}

pub struct GetState;

pub struct HasSub {
    pub channel: String,
}

pub(crate) struct Established<T: Transport> {
    epoch: u64,
    reader: T::Reader,
    writer: T::Writer,
}

impl<T: Transport> Actor for SessionActor<T> {
    type Args = SessionArgs<T>;
    type Error = ClientError;

    fn name() -> &'static str {
        "SessionActor"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> ClientResult<Self> {
        let SessionArgs {
            url,
            config,
            events,
            transport,
            codec,
            http,
            reconnect,
        } = args;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = reconnect.unwrap_or_else(|| {
            Box::new(DecorrelatedJitter::new(config.retry, config.max_retry))
        });
        let heartbeat = HeartbeatMonitor::new(config.ping_interval, config.pong_wait);

        Ok(Self {
            url,
            config,
            events,
            transport,
            codec,
            http,
            actor_ref: ctx,
            status: Status::Disconnected,
            client_id: None,
            latency: None,
            credentials: None,
            connect_data: None,
            next_id: 1,
            pending: PendingCalls::default(),
            subs: HashMap::new(),
            last_seen: HashMap::new(),
            batching: false,
            outbound_queue: Vec::new(),
            auth_batching: false,
            auth_batch: Vec::new(),
            backoff,
            heartbeat,
            io_active: false,
            writer_ref: None,
            reader_task: None,
            ping_task: None,
            shutdown_tx,
            shutdown_rx,
            user_disconnected: false,
            disconnect_emitted: false,
            reconnect_epoch: 0,
            refresh_epoch: 0,
            refresh_in_flight: false,
            refresh_required: false,
            refresh_failures: 0,
            expiry_scheduled_at: None,
            connect_sent_at: None,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> ClientResult<()> {
        self.teardown_io().await;
        self.fail_pending_disconnected();
        Ok(())
    }

    #[allow(clippy::manual_async_fn)]
    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "SessionActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

impl<T: Transport> KameoMessage<SessionEvent> for SessionActor<T> {
    type Reply = ClientResult<()>;

    async fn handle(
        &mut self,
        event: SessionEvent,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match event {
            SessionEvent::Connect => self.handle_user_connect().await,
            SessionEvent::Disconnect => self.handle_user_disconnect().await,
            SessionEvent::Inbound(frame) => self.process_inbound(frame).await,
            SessionEvent::TransportClosed { directive } => {
                self.handle_transport_loss(directive).await;
                Ok(())
            }
            SessionEvent::DialFailed { epoch, error } => {
                self.handle_dial_failed(epoch, error);
                Ok(())
            }
            SessionEvent::ReconnectTick { epoch } => {
                if epoch == self.reconnect_epoch
                    && !self.user_disconnected
                    && self.status == Status::Connecting
                {
                    self.dial();
                }
                Ok(())
            }
            SessionEvent::ExpirePending => self.expire_pending().await,
            SessionEvent::EmitPing => self.emit_ping().await,
            SessionEvent::PongDeadline { seq } => {
                if self.status == Status::Connected && self.heartbeat.is_stale(seq) {
                    self.handle_transport_loss(DisconnectDirective::new("no ping", true))
                        .await;
                }
                Ok(())
            }
            SessionEvent::RefreshDue { epoch } => {
                if epoch == self.refresh_epoch && !self.refresh_in_flight {
                    self.start_refresh();
                }
                Ok(())
            }
            SessionEvent::RefreshResolved { epoch, result } => {
                self.handle_refresh_resolved(epoch, result).await
            }
            SessionEvent::AuthResolved { channels, result } => {
                self.handle_auth_resolved(channels, result).await
            }
            SessionEvent::SetCredentials(credentials) => {
                self.credentials = Some(credentials);
                Ok(())
            }
            SessionEvent::SetConnectData(data) => {
                self.connect_data = Some(data);
                Ok(())
            }
            SessionEvent::StartBatching => {
                self.batching = true;
                Ok(())
            }
            SessionEvent::StopBatching { flush } => {
                self.batching = false;
                if flush {
                    self.flush_queue().await?;
                }
                Ok(())
            }
            SessionEvent::Flush => self.flush_queue().await,
            SessionEvent::StartAuthBatching => {
                self.auth_batching = true;
                Ok(())
            }
            SessionEvent::StopAuthBatching => {
                self.auth_batching = false;
                self.flush_auth_batch();
                Ok(())
            }
        }
    }
}

impl<T: Transport> KameoMessage<Established<T>> for SessionActor<T> {
    type Reply = ClientResult<()>;

    async fn handle(
        &mut self,
        msg: Established<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.on_established(msg.epoch, msg.reader, msg.writer).await
    }
}

impl<T: Transport> KameoMessage<Call> for SessionActor<T> {
    type Reply = DelegatedReply<ClientResult<CommandResult>>;

    async fn handle(&mut self, msg: Call, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.status != Status::Connected {
            return ctx.reply(Err(ClientError::Disconnected));
        }

        let (delegated, sender) = ctx.reply_sender();
        let waiter = match sender {
            Some(sender) => Waiter::Caller(sender),
            None => Waiter::Ignore,
        };
        self.issue(msg.params, waiter).await;
        delegated
    }
}

impl<T: Transport> KameoMessage<Fire> for SessionActor<T> {
    type Reply = ClientResult<()>;

    async fn handle(&mut self, msg: Fire, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.status != Status::Connected {
            return Err(ClientError::Disconnected);
        }
        let command = Command::new(0, Params::Send(crate::protocol::SendParams { data: msg.data }));
        self.dispatch_outbound(command).await;
        Ok(())
    }
}

impl<T: Transport> KameoMessage<SubscribeChannel> for SessionActor<T> {
    type Reply = ClientResult<()>;

    async fn handle(
        &mut self,
        msg: SubscribeChannel,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if msg.channel.is_empty() {
            return Err(ClientError::BadChannel(msg.channel));
        }
        if !self.config.resubscribe && self.status != Status::Connected {
            return Err(ClientError::InvalidState(
                "subscribe with resubscribe=false requires a connected session".to_string(),
            ));
        }

        let entry = self
            .subs
            .entry(msg.channel.clone())
            .or_insert_with(|| SubEntry::new(msg.channel.clone(), SubscriptionEvents::default()));
        if let Some(events) = msg.events {
            entry.events = events;
        }
        entry.should_resubscribe = true;
        entry.last_error = None;

        if self.status == Status::Connected
            && !matches!(entry.state, SubState::Subscribing | SubState::Subscribed)
        {
            self.begin_subscribe(&msg.channel).await;
            if !self.auth_batching {
                self.flush_auth_batch();
            }
        }
        Ok(())
    }
}

impl<T: Transport> KameoMessage<UnsubscribeChannel> for SessionActor<T> {
    type Reply = ClientResult<()>;

    async fn handle(
        &mut self,
        msg: UnsubscribeChannel,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let Some(entry) = self.subs.get_mut(&msg.channel) else {
            return Ok(());
        };
        entry.should_resubscribe = false;
        let was_active = matches!(entry.state, SubState::Subscribing | SubState::Subscribed);
        entry.state = SubState::Unsubscribed;
        if was_active {
            entry.emit_unsubscribe();
            if self.status == Status::Connected {
                self.issue(
                    Params::Unsubscribe(UnsubscribeParams {
                        channel: msg.channel,
                    }),
                    Waiter::Ignore,
                )
                .await;
            }
        }
        Ok(())
    }
}

impl<T: Transport> KameoMessage<GetState> for SessionActor<T> {
    type Reply = ClientResult<StateSnapshot>;

    async fn handle(&mut self, _msg: GetState, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Ok(StateSnapshot {
            status: self.status,
            client_id: self.client_id.clone(),
            latency: self.latency,
        })
    }
}

impl<T: Transport> KameoMessage<HasSub> for SessionActor<T> {
    type Reply = ClientResult<bool>;

    async fn handle(&mut self, msg: HasSub, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Ok(self.subs.contains_key(&msg.channel))
    }
}

impl<T: Transport> SessionActor<T> {
    // ---- lifecycle -------------------------------------------------------

    async fn handle_user_connect(&mut self) -> ClientResult<()> {
        if self.status != Status::Disconnected {
            return Ok(());
        }
        self.user_disconnected = false;
        self.disconnect_emitted = false;
        self.refresh_failures = 0;
        self.status = Status::Connecting;
        self.dial();
        Ok(())
    }

    async fn handle_user_disconnect(&mut self) -> ClientResult<()> {
        if self.status == Status::Disconnected {
            return Ok(());
        }
        self.user_disconnected = true;
        self.reconnect_epoch = self.reconnect_epoch.wrapping_add(1);
        self.refresh_epoch = self.refresh_epoch.wrapping_add(1);
        self.refresh_in_flight = false;

        if self.io_active {
            self.teardown_io().await;
            self.fail_pending_disconnected();
            self.heartbeat.reset();
        }
        self.finish_disconnect(DisconnectDirective::new("client", false));
        Ok(())
    }

    fn dial(&mut self) {
        if self.io_active || self.user_disconnected {
            return;
        }
        if self.refresh_required {
            // Expired credentials: run the refresh procedure first; its
            // completion re-enters the dial path.
            if !self.refresh_in_flight {
                self.start_refresh();
            }
            return;
        }

        self.status = Status::Connecting;
        let epoch = self.reconnect_epoch;
        let transport = self.transport.clone();
        let url = self.url.clone();
        let self_ref = self.actor_ref.clone();
        info!(url = %self.url, transport = transport.name(), "dialing broker");
        tokio::spawn(async move {
            match transport.connect(url).await {
                Ok((reader, writer)) => {
                    let _ = self_ref
                        .tell(Established::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(err) => {
                    let _ = self_ref
                        .tell(SessionEvent::DialFailed {
                            epoch,
                            error: err.to_string(),
                        })
                        .send()
                        .await;
                }
            }
        });
    }

    fn handle_dial_failed(&mut self, epoch: u64, error: String) {
        if epoch != self.reconnect_epoch || self.user_disconnected {
            return;
        }
        warn!(url = %self.url, error = %error, "broker dial failed");
        self.finish_disconnect(DisconnectDirective::new(
            format!("connect failed: {error}"),
            true,
        ));
    }

    async fn on_established(
        &mut self,
        epoch: u64,
        reader: T::Reader,
        writer: T::Writer,
    ) -> ClientResult<()> {
        if epoch != self.reconnect_epoch || self.user_disconnected || self.io_active {
            // A user disconnect or a newer dial superseded this connection;
            // dropping the halves closes the socket.
            return Ok(());
        }

        info!(url = %self.url, "transport open");
        self.io_active = true;
        self.backoff.reset();

        let writer_ref = WriterActor::spawn(WriterActor::new(writer, self.shutdown_rx.clone()));
        self.writer_ref = Some(writer_ref);
        self.spawn_reader(reader);

        self.connect_sent_at = Some(Instant::now());
        self.issue(
            Params::Connect(ConnectParams {
                credentials: self.credentials.clone(),
                data: self.connect_data.clone(),
            }),
            Waiter::Connect,
        )
        .await;
        Ok(())
    }

    fn spawn_reader(&mut self, mut reader: T::Reader) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let self_ref = self.actor_ref.clone();
        self.reader_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow_and_update() { break; }
                    }
                    frame = reader.next() => {
                        match frame {
                            Some(Ok(Frame::Close(close))) => {
                                let reason = close
                                    .as_ref()
                                    .and_then(|f| std::str::from_utf8(f.reason.as_ref()).ok())
                                    .unwrap_or("connection closed");
                                let directive = DisconnectDirective::from_close_reason(reason);
                                let _ = self_ref
                                    .tell(SessionEvent::TransportClosed { directive })
                                    .send()
                                    .await;
                                break;
                            }
                            Some(Ok(frame)) => {
                                if self_ref.tell(SessionEvent::Inbound(frame)).send().await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(err)) => {
                                let directive =
                                    DisconnectDirective::new(format!("read error: {err}"), true);
                                let _ = self_ref
                                    .tell(SessionEvent::TransportClosed { directive })
                                    .send()
                                    .await;
                                break;
                            }
                            None => {
                                let directive =
                                    DisconnectDirective::new("connection closed", true);
                                let _ = self_ref
                                    .tell(SessionEvent::TransportClosed { directive })
                                    .send()
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }
        }));
    }

    async fn teardown_io(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.reader_task.take()
            && let Err(err) = handle.await
        {
            warn!("reader task terminated with error: {err}");
        }
        if let Some(handle) = self.ping_task.take() {
            handle.abort();
        }
        if let Some(writer) = self.writer_ref.take() {
            let _ = writer.stop_gracefully().await;
            writer.wait_for_shutdown().await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;
        self.shutdown_rx = shutdown_rx;
        self.io_active = false;
        self.connect_sent_at = None;
        self.outbound_queue.clear();
    }

    async fn handle_transport_loss(&mut self, directive: DisconnectDirective) {
        if !self.io_active {
            return;
        }
        if let Some(observer) = self.config.on_transport_close.clone() {
            observer(&directive);
        }
        self.teardown_io().await;
        self.fail_pending_disconnected();
        self.heartbeat.reset();
        self.finish_disconnect(directive);
    }

    fn finish_disconnect(&mut self, directive: DisconnectDirective) {
        let reconnect = directive.reconnect && !self.user_disconnected;
        self.update_subs_on_disconnect(reconnect);
        self.client_id = None;
        self.status = if reconnect {
            Status::Connecting
        } else {
            Status::Disconnected
        };

        if !self.disconnect_emitted {
            self.disconnect_emitted = true;
            let event = DisconnectEvent {
                reason: directive.reason.clone(),
                reconnect,
            };
            if let Some(handler) = self.events.on_disconnect.as_mut() {
                handler(event);
            }
        }

        if reconnect {
            let delay = self.backoff.next_delay();
            self.reconnect_epoch = self.reconnect_epoch.wrapping_add(1);
            let epoch = self.reconnect_epoch;
            info!(
                url = %self.url,
                reason = %directive.reason,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            let self_ref = self.actor_ref.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = self_ref.tell(SessionEvent::ReconnectTick { epoch }).send().await;
            });
        } else {
            debug!(url = %self.url, reason = %directive.reason, "session disconnected");
        }
    }

    fn update_subs_on_disconnect(&mut self, reconnect: bool) {
        let resubscribe_cfg = self.config.resubscribe;
        let mut discard = Vec::new();
        for (channel, entry) in self.subs.iter_mut() {
            let keep = reconnect && resubscribe_cfg && entry.should_resubscribe;
            match entry.state {
                SubState::Subscribed => {
                    entry.state = if keep {
                        SubState::Subscribing
                    } else {
                        SubState::Unsubscribed
                    };
                    entry.emit_unsubscribe();
                }
                SubState::Subscribing if !keep => {
                    entry.state = SubState::Unsubscribed;
                }
                _ => {}
            }
            if !entry.should_resubscribe || !resubscribe_cfg {
                discard.push(channel.clone());
            }
        }
        for channel in discard {
            self.subs.remove(&channel);
            self.last_seen.remove(&channel);
        }
    }

    fn fail_pending_disconnected(&mut self) {
        for (_, entry) in self.pending.drain() {
            match entry.waiter {
                Waiter::Caller(sender) => sender.send(Err(ClientError::Disconnected)),
                // Internal continuations are re-driven by the reconnect path:
                // surviving channels stay `Subscribing` and resubscribe.
                Waiter::Connect | Waiter::Refresh | Waiter::Subscribe { .. } | Waiter::Ignore => {}
            }
        }
        self.expiry_scheduled_at = None;
    }

    // ---- multiplexer -----------------------------------------------------

    async fn issue(&mut self, params: Params, waiter: Waiter) {
        let id = self.next_id;
        self.next_id += 1;
        let command = Command::new(id, params);
        let deadline = Instant::now() + self.config.timeout;
        self.pending.insert(id, command.method(), deadline, waiter);
        self.schedule_expiry();
        self.dispatch_outbound(command).await;
    }

    async fn dispatch_outbound(&mut self, command: Command) {
        if self.batching {
            self.outbound_queue.push(command);
            return;
        }
        self.send_commands(vec![command]).await;
    }

    async fn flush_queue(&mut self) -> ClientResult<()> {
        if self.outbound_queue.is_empty() {
            return Ok(());
        }
        let commands = std::mem::take(&mut self.outbound_queue);
        self.send_commands(commands).await;
        Ok(())
    }

    async fn send_commands(&mut self, commands: Vec<Command>) {
        let frame = match self.codec.encode_commands(&commands) {
            Ok(bytes) => payload_frame(bytes, self.codec.binary_frames()),
            Err(err) => {
                warn!(error = %err, "failed to encode outbound frame");
                for command in &commands {
                    if command.id != 0
                        && let Some(entry) = self.pending.remove(command.id)
                    {
                        self.fail_waiter(entry.waiter, err.clone()).await;
                    }
                }
                return;
            }
        };

        let Some(writer) = self.writer_ref.clone() else {
            return;
        };
        if let Err(err) = writer.ask(WriteFrame { frame }).await {
            let msg = err.to_string();
            warn!(url = %self.url, error = %msg, "writer send failed");
            self.handle_transport_loss(DisconnectDirective::new(
                format!("write failed: {msg}"),
                true,
            ))
            .await;
        }
    }

    fn schedule_expiry(&mut self) {
        let Some(next_deadline) = self.pending.next_deadline() else {
            self.expiry_scheduled_at = None;
            return;
        };

        let now = Instant::now();
        let delay = next_deadline
            .checked_duration_since(now)
            .unwrap_or(Duration::ZERO);
        let when = now + delay;

        if let Some(existing) = self.expiry_scheduled_at
            && existing <= when
        {
            return;
        }

        self.expiry_scheduled_at = Some(when);
        let self_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = self_ref.tell(SessionEvent::ExpirePending).send().await;
        });
    }

    async fn expire_pending(&mut self) -> ClientResult<()> {
        self.expiry_scheduled_at = None;
        let expired = self.pending.expire_due(Instant::now());
        for (id, entry) in expired {
            debug!(id, method = entry.method.as_str(), "pending call timed out");
            self.fail_waiter(entry.waiter, ClientError::Timeout).await;
        }
        self.schedule_expiry();
        Ok(())
    }

    async fn fail_waiter(&mut self, waiter: Waiter, error: ClientError) {
        match waiter {
            Waiter::Caller(sender) => sender.send(Err(error)),
            Waiter::Connect => {
                self.handle_transport_loss(DisconnectDirective::new(
                    format!("connect failed: {error}"),
                    true,
                ))
                .await;
            }
            Waiter::Refresh => self.refresh_attempt_failed(error.to_string()),
            Waiter::Subscribe { channel } => self.fail_subscribe(channel, error),
            Waiter::Ignore => {}
        }
    }

    // ---- inbound dispatch ------------------------------------------------

    async fn process_inbound(&mut self, frame: Frame) -> ClientResult<()> {
        self.heartbeat.mark_inbound();
        match &frame {
            Frame::Ping(payload) => {
                if let Some(writer) = self.writer_ref.clone() {
                    let _ = writer
                        .ask(WriteFrame {
                            frame: Frame::Pong(payload.clone()),
                        })
                        .await;
                }
                return Ok(());
            }
            Frame::Pong(_) | Frame::Close(_) => return Ok(()),
            Frame::Text(_) | Frame::Binary(_) => {}
        }

        let Some(bytes) = frame_bytes(&frame) else {
            return Ok(());
        };
        let replies = match self.codec.decode_replies(bytes) {
            Ok(replies) => replies,
            Err(err) => {
                warn!(url = %self.url, error = %err, "dropping undecodable frame");
                return Ok(());
            }
        };
        for reply in replies {
            self.dispatch_reply(reply).await;
        }
        Ok(())
    }

    async fn dispatch_reply(&mut self, mut reply: Reply) {
        if reply.id == 0 {
            self.dispatch_push(reply);
            return;
        }

        let Some(entry) = self.pending.remove(reply.id) else {
            debug!(id = reply.id, "dropping reply for unknown id");
            return;
        };

        if let Some(error) = reply.take_error() {
            let error = ClientError::Server {
                code: error.code,
                message: error.message,
            };
            if error.is_timeout() {
                // A server-reported timeout means the broker lost track of
                // the command; escalate to a full reconnect.
                if let Waiter::Caller(sender) = entry.waiter {
                    sender.send(Err(ClientError::Timeout));
                }
                self.handle_transport_loss(DisconnectDirective::new("timeout", true))
                    .await;
                return;
            }
            self.fail_reply_waiter(entry.waiter, error).await;
            return;
        }

        match entry.waiter {
            Waiter::Caller(sender) => {
                let result = self.decode_result(entry.method, reply.result.as_ref());
                sender.send(result);
            }
            Waiter::Connect => match self.decode_connect(reply.result.as_ref(), "connect") {
                Ok(result) => self.on_connect_reply(result).await,
                Err(err) => {
                    self.handle_transport_loss(DisconnectDirective::new(
                        format!("connect reply undecodable: {err}"),
                        true,
                    ))
                    .await;
                }
            },
            Waiter::Refresh => match self.decode_connect(reply.result.as_ref(), "refresh") {
                Ok(result) => self.on_refresh_reply(result),
                Err(err) => self.refresh_attempt_failed(err.to_string()),
            },
            Waiter::Subscribe { channel } => {
                let result = match reply.result.as_ref() {
                    Some(raw) => self.codec.decode_command_result(Method::Subscribe, raw),
                    None => Ok(CommandResult::Subscribe(SubscribeResult::default())),
                };
                match result {
                    Ok(CommandResult::Subscribe(result)) => {
                        self.on_subscribe_reply(&channel, result)
                    }
                    Ok(_) | Err(_) => self.fail_subscribe(
                        channel,
                        ClientError::Codec("subscribe reply undecodable".to_string()),
                    ),
                }
            }
            Waiter::Ignore => {}
        }
    }

    async fn fail_reply_waiter(&mut self, waiter: Waiter, error: ClientError) {
        match waiter {
            Waiter::Caller(sender) => sender.send(Err(error)),
            Waiter::Connect => {
                self.handle_transport_loss(DisconnectDirective::new(
                    format!("connect rejected: {error}"),
                    true,
                ))
                .await;
            }
            Waiter::Refresh => self.refresh_attempt_failed(error.to_string()),
            Waiter::Subscribe { channel } => self.fail_subscribe(channel, error),
            Waiter::Ignore => {}
        }
    }

    fn decode_result(
        &self,
        method: Method,
        raw: Option<&RawPayload>,
    ) -> ClientResult<CommandResult> {
        match raw {
            Some(raw) => self.codec.decode_command_result(method, raw),
            None => Ok(empty_result(method)),
        }
    }

    fn decode_connect(
        &self,
        raw: Option<&RawPayload>,
        context: &str,
    ) -> ClientResult<ConnectResult> {
        let Some(raw) = raw else {
            return Err(ClientError::Codec(format!("{context} reply without result")));
        };
        let method = if context == "refresh" {
            Method::Refresh
        } else {
            Method::Connect
        };
        match self.codec.decode_command_result(method, raw)? {
            CommandResult::Connect(result) | CommandResult::Refresh(result) => Ok(result),
            _ => Err(ClientError::Codec(format!("{context} reply shape mismatch"))),
        }
    }

    fn dispatch_push(&mut self, reply: Reply) {
        let Some(raw) = reply.result else {
            return;
        };
        let push = match self.codec.decode_push(&raw) {
            Ok(push) => push,
            Err(err) => {
                warn!(error = %err, "dropping undecodable push");
                return;
            }
        };
        let data = match self.codec.decode_push_data(push.kind, &push.data) {
            Ok(data) => data,
            Err(err) => {
                warn!(channel = %push.channel, error = %err, "dropping undecodable push payload");
                return;
            }
        };

        match data {
            PushData::Publication(publication) => {
                self.last_seen
                    .insert(push.channel.clone(), publication.uid.clone());
                if let Some(entry) = self.subs.get_mut(&push.channel)
                    && !matches!(entry.state, SubState::Unsubscribed | SubState::Error)
                {
                    entry.emit_publish(publication);
                }
            }
            PushData::Join(info) => {
                if let Some(entry) = self.subs.get_mut(&push.channel) {
                    entry.emit_join(info);
                }
            }
            PushData::Leave(info) => {
                if let Some(entry) = self.subs.get_mut(&push.channel) {
                    entry.emit_leave(info);
                }
            }
            PushData::Unsub => {
                if let Some(entry) = self.subs.get_mut(&push.channel)
                    && matches!(entry.state, SubState::Subscribing | SubState::Subscribed)
                {
                    entry.state = SubState::Unsubscribed;
                    entry.emit_unsubscribe();
                }
            }
            PushData::Message(data) => {
                if let Some(handler) = self.events.on_message.as_mut() {
                    handler(data);
                }
            }
        }
    }

    // ---- connect reply / resubscribe ------------------------------------

    async fn on_connect_reply(&mut self, result: ConnectResult) {
        if result.expired {
            info!(url = %self.url, "credentials expired on connect");
            self.refresh_required = true;
            self.handle_transport_loss(DisconnectDirective::new("expired", true))
                .await;
            return;
        }

        self.status = Status::Connected;
        self.client_id = Some(result.client.clone());
        self.latency = self.connect_sent_at.take().map(|sent| sent.elapsed());
        self.disconnect_emitted = false;
        self.heartbeat.reset();

        if result.expires && result.ttl > 0 {
            self.arm_refresh_timer(Duration::from_secs(result.ttl));
        }
        if self.config.ping {
            self.start_ping_task();
        }

        info!(
            url = %self.url,
            client = %result.client,
            latency_us = self.latency.map(|l| l.as_micros() as u64),
            "session connected"
        );

        let channels: Vec<String> = self
            .subs
            .values()
            .filter(|entry| entry.should_resubscribe)
            .map(|entry| entry.channel.clone())
            .collect();
        for channel in &channels {
            self.begin_subscribe(channel).await;
        }
        if !self.auth_batching {
            self.flush_auth_batch();
        }

        let event = ConnectEvent {
            client: result.client,
            transport: self.transport.name(),
            latency: self.latency.unwrap_or_default(),
            data: result.data,
        };
        if let Some(handler) = self.events.on_connect.as_mut() {
            handler(event);
        }
    }

    async fn begin_subscribe(&mut self, channel: &str) {
        let Some(entry) = self.subs.get_mut(channel) else {
            return;
        };
        entry.state = SubState::Subscribing;

        if self.config.is_private(channel) {
            self.auth_batch.push(channel.to_string());
            return;
        }

        let params = self.subscribe_params(channel, None, None, false);
        self.issue(
            Params::Subscribe(params),
            Waiter::Subscribe {
                channel: channel.to_string(),
            },
        )
        .await;
    }

    fn subscribe_params(
        &self,
        channel: &str,
        info: Option<Value>,
        sign: Option<String>,
        private: bool,
    ) -> SubscribeParams {
        let last = self.last_seen.get(channel).cloned();
        SubscribeParams {
            channel: channel.to_string(),
            client: private.then(|| self.client_id.clone().unwrap_or_default()),
            info,
            sign,
            recover: last.is_some().then_some(true),
            last,
        }
    }

    fn on_subscribe_reply(&mut self, channel: &str, result: SubscribeResult) {
        let Some(entry) = self.subs.get_mut(channel) else {
            return;
        };
        if entry.state != SubState::Subscribing {
            return;
        }
        entry.state = SubState::Subscribed;
        entry.last_error = None;

        match result.publications {
            Some(publications) => {
                // Wire order is newest-first; deliver chronologically.
                for publication in publications.into_iter().rev() {
                    self.last_seen
                        .insert(channel.to_string(), publication.uid.clone());
                    if let Some(entry) = self.subs.get_mut(channel) {
                        entry.emit_publish(publication);
                    }
                }
            }
            None => {
                if let Some(last) = result.last {
                    self.last_seen.insert(channel.to_string(), last);
                }
            }
        }

        if let Some(entry) = self.subs.get_mut(channel) {
            entry.emit_subscribe(result.recovered);
        }
    }

    // A local per-call deadline lands here too; only a broker-reported
    // `{0, "timeout"}` escalates to a reconnect, and that happens in
    // `dispatch_reply` before this is reached.
    fn fail_subscribe(&mut self, channel: String, error: ClientError) {
        if let Some(entry) = self.subs.get_mut(&channel)
            && entry.state == SubState::Subscribing
        {
            entry.state = SubState::Error;
            entry.last_error = Some(error.clone());
            entry.emit_error(&error);
        }
    }

    // ---- private-channel authorization ----------------------------------

    fn flush_auth_batch(&mut self) {
        let channels = std::mem::take(&mut self.auth_batch);
        if channels.is_empty() {
            return;
        }

        let client = self.client_id.clone().unwrap_or_default();
        let self_ref = self.actor_ref.clone();
        let future = if let Some(callback) = self.config.on_auth.clone() {
            callback(AuthContext {
                client,
                channels: channels.clone(),
            })
        } else {
            let body = match to_value(&AuthRequest {
                client: &client,
                channels: &channels,
            }) {
                Ok(body) => body,
                Err(err) => {
                    let channels = channels.clone();
                    tokio::spawn(async move {
                        let _ = self_ref
                            .tell(SessionEvent::AuthResolved {
                                channels,
                                result: Err(err),
                            })
                            .send()
                            .await;
                    });
                    return;
                }
            };
            self.http.post_json(
                self.config.auth_endpoint.clone(),
                self.config.auth_headers.clone(),
                self.config.auth_params.clone(),
                body,
            )
        };

        debug!(channels = channels.len(), "requesting private channel authorization");
        tokio::spawn(async move {
            let result = future.await;
            let _ = self_ref
                .tell(SessionEvent::AuthResolved { channels, result })
                .send()
                .await;
        });
    }

    async fn handle_auth_resolved(
        &mut self,
        channels: Vec<String>,
        result: ClientResult<Value>,
    ) -> ClientResult<()> {
        if self.status != Status::Connected {
            // Channels stay `Subscribing` and re-enter the auth path after
            // the next connect.
            return Ok(());
        }

        let grants = match result {
            Ok(grants) => grants,
            Err(err) => {
                warn!(error = %err, "private channel authorization failed");
                for channel in channels {
                    self.fail_subscribe(channel, ClientError::AuthorizationFailed);
                }
                return Ok(());
            }
        };

        // Share one outbound frame for the per-channel SUBSCRIBEs unless the
        // caller already batches.
        let wrap_batch = !self.batching;
        if wrap_batch {
            self.batching = true;
        }

        for channel in channels {
            let Some(grant) = grants.get(channel.as_str()) else {
                self.fail_subscribe(channel, ClientError::AuthorizationFailed);
                continue;
            };
            let status = grant.get("status").and_then(|v| v.as_u64()).unwrap_or(200);
            if status != 200 {
                self.fail_subscribe(channel, ClientError::AuthorizationFailed);
                continue;
            }
            let info = grant.get("info").cloned();
            let sign = grant
                .get("sign")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            let subscribing = self
                .subs
                .get(&channel)
                .map(|entry| entry.state == SubState::Subscribing)
                .unwrap_or(false);
            if !subscribing {
                continue;
            }
            let params = self.subscribe_params(&channel, info, sign, true);
            self.issue(Params::Subscribe(params), Waiter::Subscribe { channel })
                .await;
        }

        if wrap_batch {
            self.batching = false;
            self.flush_queue().await?;
        }
        Ok(())
    }

    // ---- credential refresh ----------------------------------------------

    fn arm_refresh_timer(&mut self, ttl: Duration) {
        self.refresh_epoch = self.refresh_epoch.wrapping_add(1);
        let epoch = self.refresh_epoch;
        debug!(ttl_secs = ttl.as_secs(), "arming credential refresh timer");
        let self_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let _ = self_ref.tell(SessionEvent::RefreshDue { epoch }).send().await;
        });
    }

    fn start_refresh(&mut self) {
        if self.config.refresh_attempts == Some(0) {
            self.refresh_terminal();
            return;
        }

        self.refresh_in_flight = true;
        let epoch = self.refresh_epoch;
        let self_ref = self.actor_ref.clone();
        let future = if let Some(callback) = self.config.on_refresh.clone() {
            callback(RefreshContext {
                data: self.config.refresh_data.clone(),
            })
        } else {
            self.http.post_json(
                self.config.refresh_endpoint.clone(),
                self.config.refresh_headers.clone(),
                self.config.refresh_params.clone(),
                self.config.refresh_data.clone(),
            )
        };

        debug!(url = %self.url, "issuing credential refresh");
        tokio::spawn(async move {
            let result = future.await;
            let _ = self_ref
                .tell(SessionEvent::RefreshResolved { epoch, result })
                .send()
                .await;
        });
    }

    async fn handle_refresh_resolved(
        &mut self,
        epoch: u64,
        result: ClientResult<Value>,
    ) -> ClientResult<()> {
        if epoch != self.refresh_epoch {
            return Ok(());
        }
        self.refresh_in_flight = false;

        match result {
            Ok(value) => {
                self.merge_credentials(&value);
                self.refresh_failures = 0;
                self.refresh_required = false;
                if self.status == Status::Connected {
                    let Some(credentials) = self.credentials.clone() else {
                        return Ok(());
                    };
                    self.issue(
                        Params::Refresh(crate::protocol::RefreshParams { credentials }),
                        Waiter::Refresh,
                    )
                    .await;
                } else if !self.user_disconnected {
                    self.dial();
                }
            }
            Err(err) => self.refresh_attempt_failed(err.to_string()),
        }
        Ok(())
    }

    fn merge_credentials(&mut self, value: &Value) {
        let mut credentials = self.credentials.clone().unwrap_or_default();
        if let Some(user) = value.get("user").and_then(|v| v.as_str()) {
            credentials.user = user.to_string();
        }
        if let Some(exp) = value.get("exp") {
            credentials.exp = exp
                .as_str()
                .map(|s| s.to_string())
                .or_else(|| exp.as_u64().map(|n| n.to_string()))
                .unwrap_or_default();
        }
        if let Some(info) = value.get("info") {
            credentials.info = Some(info.clone());
        }
        if let Some(sign) = value.get("sign").and_then(|v| v.as_str()) {
            credentials.sign = sign.to_string();
        }
        self.credentials = Some(credentials);
    }

    fn on_refresh_reply(&mut self, result: ConnectResult) {
        if result.expired {
            self.start_refresh();
            return;
        }
        if result.expires && result.ttl > 0 {
            self.arm_refresh_timer(Duration::from_secs(result.ttl));
        }
    }

    fn refresh_attempt_failed(&mut self, error: String) {
        self.refresh_failures += 1;
        warn!(
            url = %self.url,
            error = %error,
            failures = self.refresh_failures,
            "credential refresh failed"
        );

        if let Some(cap) = self.config.refresh_attempts
            && self.refresh_failures >= cap
        {
            self.refresh_terminal();
            return;
        }

        let delay = self.config.refresh_interval + uniform_jitter(Duration::from_millis(1000));
        let epoch = self.refresh_epoch;
        let self_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = self_ref.tell(SessionEvent::RefreshDue { epoch }).send().await;
        });
    }

    fn refresh_terminal(&mut self) {
        warn!(url = %self.url, "credential refresh attempts exhausted");
        if let Some(handler) = self.events.on_refresh_failed.as_mut() {
            handler();
        }
        // Terminal: no further reconnects until the user calls connect().
        self.user_disconnected = true;
        self.reconnect_epoch = self.reconnect_epoch.wrapping_add(1);
        self.refresh_epoch = self.refresh_epoch.wrapping_add(1);

        let self_ref = self.actor_ref.clone();
        if self.io_active {
            tokio::spawn(async move {
                let _ = self_ref
                    .tell(SessionEvent::TransportClosed {
                        directive: DisconnectDirective::new("refresh failed", false),
                    })
                    .send()
                    .await;
            });
        } else {
            self.finish_disconnect(DisconnectDirective::new("refresh failed", false));
        }
    }

    // ---- heartbeat -------------------------------------------------------

    fn start_ping_task(&mut self) {
        if let Some(handle) = self.ping_task.take() {
            handle.abort();
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.heartbeat.interval();
        let self_ref = self.actor_ref.clone();
        self.ping_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so pings start one
            // interval after connect.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    _ = ticker.tick() => {
                        if self_ref.tell(SessionEvent::EmitPing).send().await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    async fn emit_ping(&mut self) -> ClientResult<()> {
        if self.status != Status::Connected {
            return Ok(());
        }
        self.issue(Params::Ping, Waiter::Ignore).await;
        let seq = self.heartbeat.mark_ping();
        let wait = self.heartbeat.pong_wait();
        let self_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = self_ref.tell(SessionEvent::PongDeadline { seq }).send().await;
        });
        Ok(())
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    client: &'a str,
    channels: &'a [String],
}

fn to_value<V: Serialize>(value: &V) -> ClientResult<Value> {
    let bytes = sonic_rs::to_vec(value).map_err(|e| ClientError::Codec(e.to_string()))?;
    sonic_rs::from_slice(&bytes).map_err(|e| ClientError::Codec(e.to_string()))
}

fn empty_result(method: Method) -> CommandResult {
    match method {
        Method::Connect => CommandResult::Connect(ConnectResult::default()),
        Method::Refresh => CommandResult::Refresh(ConnectResult::default()),
        Method::Subscribe => CommandResult::Subscribe(SubscribeResult::default()),
        Method::Unsubscribe => CommandResult::Unsubscribe,
        Method::Publish => CommandResult::Publish,
        Method::Presence => CommandResult::Presence(Default::default()),
        Method::History => CommandResult::History(Default::default()),
        Method::Ping => CommandResult::Ping,
        Method::Rpc => CommandResult::Rpc(Default::default()),
        Method::Send => CommandResult::Send,
    }
}
