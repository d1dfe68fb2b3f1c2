//! Enqueue side of the upload queue.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::info;

use hireloop_core::{NewUploadJob, UploadQueueJob};

use super::store::{QueueStore, StoreError};
use crate::event_bus::ChangePublisher;

/// Registers uploads: store insert, then a change event so connected
/// clients see the new `Queued` job.
#[derive(Clone)]
pub struct UploadQueue {
    store: Arc<dyn QueueStore>,
    publisher: ChangePublisher,
    wake: Option<Arc<Notify>>,
}

impl std::fmt::Debug for UploadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueue")
            .field("publisher", &self.publisher)
            .field("wakes_worker", &self.wake.is_some())
            .finish_non_exhaustive()
    }
}

impl UploadQueue {
    pub fn new(store: Arc<dyn QueueStore>, publisher: ChangePublisher) -> Self {
        Self {
            store,
            publisher,
            wake: None,
        }
    }

    /// Nudge a local worker after each enqueue instead of waiting for its poll.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub async fn enqueue(&self, input: NewUploadJob) -> Result<UploadQueueJob, StoreError> {
        let job = UploadQueueJob::new(input, Utc::now());
        let id = self.store.enqueue(job.clone()).await?;
        let job = self.store.get(id).await?.unwrap_or(job);
        info!(job_id = %job.id, filename = %job.filename, "upload queued");

        self.publisher.publish(std::slice::from_ref(&job)).await;
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hireloop_core::{CandidateRef, JobStatus};
    use hireloop_events::{EventBus, InMemoryEventBus, QueueEnvelope};

    use crate::event_bus::PublishMode;
    use crate::jobs::store::InMemoryQueueStore;

    #[tokio::test]
    async fn enqueue_stores_and_announces_the_job() {
        let store = InMemoryQueueStore::arc();
        let bus = Arc::new(InMemoryEventBus::<String>::new());
        let mut sub = bus.subscribe().await.unwrap();
        let publisher = ChangePublisher::new(store.clone(), bus.clone(), PublishMode::Snapshot);
        let wake = Arc::new(Notify::new());
        let queue = UploadQueue::new(store.clone(), publisher).with_wake(wake.clone());

        let job = queue
            .enqueue(NewUploadJob::new(CandidateRef::new("cand-9").unwrap(), "r1.pdf").unwrap())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(store.get(job.id).await.unwrap().is_some());

        let envelope = QueueEnvelope::from_json(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(envelope.data()[0].id, job.id);
        assert_eq!(envelope.data()[0].status, JobStatus::Queued);

        // The stored permit makes this return immediately.
        tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
            .await
            .unwrap();
    }
}
