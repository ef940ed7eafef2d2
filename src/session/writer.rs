use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tokio::sync::watch;
use tracing::debug;

use crate::core::types::{ClientError, ClientResult};
use crate::core::Frame;

/// Writer actor owning the transport sink; serializes all writes for one
/// connection. Recreated on every reconnect.
pub struct WriterActor<W>
where
    W: Sink<Frame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    writer: W,
    shutdown_rx: watch::Receiver<bool>,
}

impl<W> WriterActor<W>
where
    W: Sink<Frame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    pub fn new(writer: W, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            writer,
            shutdown_rx,
        }
    }
}

impl<W> Actor for WriterActor<W>
where
    W: Sink<Frame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = ClientError;

    fn name() -> &'static str {
        "WriterActor"
    }

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "WriterActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

#[derive(Clone)]
pub struct WriteFrame {
    pub frame: Frame,
}

impl<W> KameoMessage<WriteFrame> for WriterActor<W>
where
    W: Sink<Frame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    type Reply = ClientResult<()>;

    async fn handle(
        &mut self,
        msg: WriteFrame,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if *self.shutdown_rx.borrow() {
            return Err(ClientError::InvalidState("writer stopped".to_string()));
        }
        debug!(target: "rtbus-writer", "sending frame to wire");
        self.writer.send(msg.frame).await?;
        Ok(())
    }
}
