//! In-memory event bus for tests/dev and single-process deployments.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{BusError, EventBus, Subscription};

/// In-memory pub/sub bus.
///
/// - Best-effort fan-out to every live subscription
/// - Publish order is preserved per subscriber
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscriptions still attached.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    async fn publish(&self, message: M) -> Result<(), BusError> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| BusError::Publish("subscriber list poisoned".to_string()))?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription<M>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| BusError::Connection("subscriber list poisoned".to_string()))?
            .push(tx);
        Ok(Subscription::new(rx))
    }
}
