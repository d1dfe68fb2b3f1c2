//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus carries **notifications**, never state: the queue store is the
//! source of truth, and a lost message only leaves a UI stale until its next
//! snapshot.
//!
//! - **Transport-agnostic**: in-process channels or Redis pub/sub
//! - **At-least-once, latest-wins**: consumers replace state on every message
//! - **In-order per subscriber**: each subscription sees publishes in the order
//!   the bus accepted them; nothing is promised across processes

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// Bus failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("bus publish error: {0}")]
    Publish(String),

    #[error("bus serialization error: {0}")]
    Serialize(String),

    #[error("bus closed")]
    Closed,
}

/// A subscription to a bus channel.
///
/// Dropping the subscription stops its feeder task (if any), which is how a
/// transport-backed subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
    feeder: Option<JoinHandle<()>>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self {
            receiver,
            feeder: None,
        }
    }

    /// Subscription fed by a background task that is aborted on drop.
    pub fn with_feeder(receiver: UnboundedReceiver<M>, feeder: JoinHandle<()>) -> Self {
        Self {
            receiver,
            feeder: Some(feeder),
        }
    }

    /// Wait for the next message; `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving and release the transport.
    pub fn close(&mut self) {
        self.receiver.close();
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

/// Domain-agnostic pub/sub bus.
///
/// ```text
/// Worker -> Queue Store (mutate) -> Change Publisher -> Bus -> Fan-out Bridge (every process)
/// ```
///
/// `publish()` failures are returned to the caller, which for queue changes
/// logs and moves on: the mutation is already durable.
#[async_trait]
pub trait EventBus<M>: Send + Sync {
    async fn publish(&self, message: M) -> Result<(), BusError>;

    async fn subscribe(&self) -> Result<Subscription<M>, BusError>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + 'static,
    B: EventBus<M> + ?Sized,
{
    async fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message).await
    }

    async fn subscribe(&self) -> Result<Subscription<M>, BusError> {
        (**self).subscribe().await
    }
}
