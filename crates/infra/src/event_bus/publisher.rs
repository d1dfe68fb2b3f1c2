//! Change Publisher: turns queue mutations into bus envelopes.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};

use hireloop_core::UploadQueueJob;
use hireloop_events::{EventBus, QueueEnvelope};

use crate::jobs::store::QueueStore;

/// What an envelope's `data` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// The full store snapshot at publish time.
    #[default]
    Snapshot,
    /// Only the jobs touched by the mutation.
    Delta,
}

impl FromStr for PublishMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Ok(PublishMode::Snapshot),
            "delta" => Ok(PublishMode::Delta),
            other => Err(format!("unknown publish mode: {other} (expected snapshot or delta)")),
        }
    }
}

/// Publishes one envelope per store mutation.
///
/// Fire-and-forget: the store is authoritative, so a failed publish is logged
/// and never fails the mutation that triggered it.
#[derive(Clone)]
pub struct ChangePublisher {
    store: Arc<dyn QueueStore>,
    bus: Arc<dyn EventBus<String>>,
    mode: PublishMode,
}

impl std::fmt::Debug for ChangePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePublisher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ChangePublisher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        bus: Arc<dyn EventBus<String>>,
        mode: PublishMode,
    ) -> Self {
        Self { store, bus, mode }
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    /// Publish the change made to `changed`. Returns whether a message went out.
    pub async fn publish(&self, changed: &[UploadQueueJob]) -> bool {
        if changed.is_empty() {
            return false;
        }

        let data = match self.mode {
            PublishMode::Delta => changed.to_vec(),
            PublishMode::Snapshot => match self.store.snapshot().await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "change publish skipped: snapshot read failed");
                    return false;
                }
            },
        };

        let payload = match QueueEnvelope::queue(data).to_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "change publish skipped: envelope serialization failed");
                return false;
            }
        };

        match self.bus.publish(payload).await {
            Ok(()) => {
                debug!(jobs = changed.len(), mode = ?self.mode, "queue change published");
                true
            }
            Err(e) => {
                warn!(error = %e, "queue change publish failed");
                false
            }
        }
    }
}
