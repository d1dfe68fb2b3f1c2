//! Process-local set of live socket connections.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

/// Connection ID (unique per process lifetime)
pub type ConnectionId = u64;

/// Message queued for one connection's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw envelope JSON, shared between every recipient.
    Text(Arc<str>),
    Close { code: u16, reason: Cow<'static, str> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection {0}: outbound queue full")]
    Backpressure(ConnectionId),
    #[error("connection {0}: socket task gone")]
    Closed(ConnectionId),
    #[error("registry is shutting down")]
    ShuttingDown,
}

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: Vec<ConnectionId>,
}

#[derive(Debug)]
struct Inner {
    connections: HashMap<ConnectionId, mpsc::Sender<Outbound>>,
    accepting: bool,
}

/// Connection registry owned by the fan-out bridge.
///
/// Each connection gets a bounded queue. Broadcast never waits on a socket: a
/// full or closed queue removes that connection and leaves the others alone.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: HashMap::new(),
                accepting: true,
            }),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn arc(buffer: usize) -> Arc<Self> {
        Arc::new(Self::new(buffer))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection. It receives every broadcast that starts after this returns.
    pub fn register(&self) -> Result<(ConnectionId, mpsc::Receiver<Outbound>), ConnectionError> {
        let mut inner = self.lock();
        if !inner.accepting {
            return Err(ConnectionError::ShuttingDown);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        inner.connections.insert(id, tx);
        debug!(connection_id = id, active = inner.connections.len(), "connection registered");
        Ok((id, rx))
    }

    /// Remove a connection. Returns whether it was still registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut inner = self.lock();
        let removed = inner.connections.remove(&id).is_some();
        if removed {
            debug!(connection_id = id, active = inner.connections.len(), "connection unregistered");
        }
        removed
    }

    /// Queue `payload` for every registered connection.
    ///
    /// The lock is held for the whole pass, so a connection registering
    /// concurrently either sees this message or was registered after it.
    pub fn broadcast(&self, payload: Arc<str>) -> BroadcastReport {
        let mut inner = self.lock();
        let mut report = BroadcastReport::default();

        inner.connections.retain(|&id, tx| {
            match tx.try_send(Outbound::Text(payload.clone())) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(e) => {
                    let err = match e {
                        mpsc::error::TrySendError::Full(_) => ConnectionError::Backpressure(id),
                        mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed(id),
                    };
                    debug!(error = %err, "dropping connection");
                    report.removed.push(id);
                    false
                }
            }
        });
        report
    }

    /// Send a close frame to every connection, empty the registry and refuse
    /// new registrations. Returns how many connections were open.
    pub fn close_all(&self, code: u16, reason: impl Into<Cow<'static, str>>) -> usize {
        let reason = reason.into();
        let mut inner = self.lock();
        inner.accepting = false;
        let count = inner.connections.len();
        for (_, tx) in inner.connections.drain() {
            // A full queue still ends the connection once the sender drops.
            let _ = tx.try_send(Outbound::Close {
                code,
                reason: reason.clone(),
            });
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }
}
