//! Queue store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use hireloop_core::{
    JobId, JobStatus, UploadQueueJob, claim_order, cutoff_before, deadline_after, snapshot_order,
};

/// Queue store abstraction.
///
/// The store is the only shared mutable resource across processes, so every
/// state change here is atomic and conditional on the job's current status.
/// No caller-side locking is needed for correctness across instances.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new job. Status is forced to `Queued` and attempts to 0.
    async fn enqueue(&self, job: UploadQueueJob) -> Result<JobId, StoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<UploadQueueJob>, StoreError>;

    /// Atomically move up to `limit` eligible jobs (oldest upload first) to
    /// `Processing`, incrementing their attempts.
    ///
    /// Eligible: `Queued`, or `Retrying` with its backoff elapsed. Returns an
    /// empty vector if none are eligible.
    async fn claim_next(&self, limit: usize) -> Result<Vec<UploadQueueJob>, StoreError>;

    /// `Processing -> Succeeded`.
    async fn mark_succeeded(&self, id: JobId) -> Result<MarkOutcome, StoreError>;

    /// `Processing -> Failed` (terminal).
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<MarkOutcome, StoreError>;

    /// `Processing -> Retrying`, eligible again after `retry_after`.
    async fn mark_retrying(
        &self,
        id: JobId,
        error: &str,
        retry_after: Duration,
    ) -> Result<MarkOutcome, StoreError>;

    /// Return jobs stuck in `Processing` for longer than `stale_after`.
    ///
    /// Jobs with attempts left go to `Retrying` (immediately eligible); jobs
    /// that already used `max_attempts` go to `Failed`.
    async fn requeue_stale(
        &self,
        stale_after: Duration,
        max_attempts: u32,
    ) -> Result<Vec<UploadQueueJob>, StoreError>;

    /// All jobs, newest upload first (ties by id).
    async fn snapshot(&self) -> Result<Vec<UploadQueueJob>, StoreError>;
}

/// Outcome of a conditional status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The job was `Processing` and now carries the new status.
    Applied(UploadQueueJob),
    /// The job had already moved past `Processing` (claimed or resolved
    /// elsewhere). Benign: nothing was written.
    Conflict { current: JobStatus },
}

impl MarkOutcome {
    pub fn applied(&self) -> Option<&UploadQueueJob> {
        match self {
            MarkOutcome::Applied(job) => Some(job),
            MarkOutcome::Conflict { .. } => None,
        }
    }
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to decode job row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Connectivity failures worth retrying; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Stale-claim error text written by the sweep.
pub const STALE_CLAIM_ERROR: &str = "processing claim went stale";

/// In-memory queue store for tests/dev and single-process deployments.
///
/// One async mutex guards the whole table, which makes every operation atomic.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    jobs: Mutex<HashMap<JobId, UploadQueueJob>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a job unconditionally (test setup helper).
    pub async fn put(&self, job: UploadQueueJob) {
        self.jobs.lock().await.insert(job.id, job);
    }

    async fn transition<F>(&self, id: JobId, apply: F) -> Result<MarkOutcome, StoreError>
    where
        F: FnOnce(&mut UploadQueueJob) + Send,
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Processing {
            return Ok(MarkOutcome::Conflict {
                current: job.status,
            });
        }
        apply(job);
        Ok(MarkOutcome::Applied(job.clone()))
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, mut job: UploadQueueJob) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        job.status = JobStatus::Queued;
        job.attempts = 0;
        job.last_error = None;
        job.next_attempt_at = None;
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<UploadQueueJob>, StoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn claim_next(&self, limit: usize) -> Result<Vec<UploadQueueJob>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<&UploadQueueJob> =
            jobs.values().filter(|j| j.is_claimable(now)).collect();
        candidates.sort_by(|a, b| claim_order(a, b));
        let ids: Vec<JobId> = candidates.iter().take(limit).map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = jobs.get_mut(&id) {
                if job.claim(now).is_ok() {
                    claimed.push(job.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn mark_succeeded(&self, id: JobId) -> Result<MarkOutcome, StoreError> {
        let now = Utc::now();
        self.transition(id, |job| {
            let _ = job.succeed(now);
        })
        .await
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<MarkOutcome, StoreError> {
        let now = Utc::now();
        self.transition(id, |job| {
            let _ = job.fail(error, now);
        })
        .await
    }

    async fn mark_retrying(
        &self,
        id: JobId,
        error: &str,
        retry_after: Duration,
    ) -> Result<MarkOutcome, StoreError> {
        let now = Utc::now();
        let next = deadline_after(now, retry_after);
        self.transition(id, |job| {
            let _ = job.retry(error, next, now);
        })
        .await
    }

    async fn requeue_stale(
        &self,
        stale_after: Duration,
        max_attempts: u32,
    ) -> Result<Vec<UploadQueueJob>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let stale_before = cutoff_before(now, stale_after);

        let mut swept = Vec::new();
        for job in jobs.values_mut().filter(|j| j.is_stale(stale_before)) {
            let result = if job.attempts >= max_attempts {
                job.fail(STALE_CLAIM_ERROR, now)
            } else {
                job.retry(STALE_CLAIM_ERROR, now, now)
            };
            if result.is_ok() {
                swept.push(job.clone());
            }
        }
        swept.sort_by(claim_order);
        Ok(swept)
    }

    async fn snapshot(&self) -> Result<Vec<UploadQueueJob>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut result: Vec<_> = jobs.values().cloned().collect();
        result.sort_by(snapshot_order);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use hireloop_core::{CandidateRef, NewUploadJob};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn new_job(filename: &str) -> UploadQueueJob {
        let input = NewUploadJob::new(CandidateRef::new("cand-1").unwrap(), filename).unwrap();
        UploadQueueJob::new(input, Utc::now())
    }

    fn job_at(filename: &str, offset_secs: i64) -> UploadQueueJob {
        let mut job = new_job(filename);
        job.upload_date = job.upload_date + ChronoDuration::seconds(offset_secs);
        job.updated_at = job.upload_date;
        job
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryQueueStore::new();
        let id = store.enqueue(new_job("r1.pdf")).await.unwrap();

        let claimed = store.claim_next(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, JobStatus::Processing);
        assert_eq!(claimed[0].attempts, 1);

        // No more jobs
        assert!(store.claim_next(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_normalizes_initial_state() {
        let store = InMemoryQueueStore::new();
        let mut job = new_job("r1.pdf");
        job.status = JobStatus::Succeeded;
        job.attempts = 7;
        let id = store.enqueue(job).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let store = InMemoryQueueStore::new();
        let job = new_job("r1.pdf");
        store.enqueue(job.clone()).await.unwrap();
        assert!(matches!(
            store.enqueue(job).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn claim_is_fifo_and_respects_limit() {
        let store = InMemoryQueueStore::new();
        let old = job_at("old.pdf", -10);
        let mid = job_at("mid.pdf", -5);
        let new = job_at("new.pdf", 0);
        for job in [new.clone(), old.clone(), mid.clone()] {
            store.enqueue(job).await.unwrap();
        }

        let first = store.claim_next(2).await.unwrap();
        assert_eq!(
            first.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![old.id, mid.id]
        );
        let second = store.claim_next(2).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, new.id);
    }

    #[tokio::test]
    async fn retrying_job_is_claimable_only_after_backoff() {
        let store = InMemoryQueueStore::new();
        let id = store.enqueue(new_job("r1.pdf")).await.unwrap();
        store.claim_next(1).await.unwrap();

        store
            .mark_retrying(id, "ocr failed", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(store.claim_next(1).await.unwrap().is_empty());

        let mut job = store.get(id).await.unwrap().unwrap();
        job.next_attempt_at = Some(Utc::now() - ChronoDuration::seconds(1));
        store.put(job).await;

        let claimed = store.claim_next(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 2);
        assert!(claimed[0].last_error.is_none());
    }

    #[tokio::test]
    async fn marks_are_conditional_on_processing() {
        let store = InMemoryQueueStore::new();
        let id = store.enqueue(new_job("r1.pdf")).await.unwrap();

        // Not yet claimed.
        assert_eq!(
            store.mark_succeeded(id).await.unwrap(),
            MarkOutcome::Conflict {
                current: JobStatus::Queued
            }
        );

        store.claim_next(1).await.unwrap();
        let outcome = store.mark_failed(id, "corrupt pdf").await.unwrap();
        let failed = outcome.applied().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("corrupt pdf"));

        // Failed is terminal: a late success is a no-op.
        assert_eq!(
            store.mark_succeeded(id).await.unwrap(),
            MarkOutcome::Conflict {
                current: JobStatus::Failed
            }
        );
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn marks_on_missing_job_are_not_found() {
        let store = InMemoryQueueStore::new();
        let missing = JobId::new();
        assert!(matches!(
            store.mark_succeeded(missing).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
        assert!(matches!(
            store.mark_retrying(missing, "x", Duration::ZERO).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_is_newest_first() {
        let store = InMemoryQueueStore::new();
        let j1 = job_at("r1.pdf", 0);
        let j2 = job_at("r2.pdf", 1);
        store.enqueue(j1.clone()).await.unwrap();
        store.enqueue(j2.clone()).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(
            snapshot.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![j2.id, j1.id]
        );
    }

    #[tokio::test]
    async fn stale_processing_jobs_are_requeued_or_failed() {
        let store = InMemoryQueueStore::new();
        let long_ago = Utc::now() - ChronoDuration::minutes(30);

        let mut retryable = new_job("a.pdf");
        retryable.claim(long_ago).unwrap();
        let mut exhausted = new_job("b.pdf");
        for _ in 0..3 {
            exhausted.status = JobStatus::Queued;
            exhausted.claim(long_ago).unwrap();
        }
        let mut fresh = new_job("c.pdf");
        fresh.claim(Utc::now()).unwrap();
        for job in [retryable.clone(), exhausted.clone(), fresh.clone()] {
            store.put(job).await;
        }

        let swept = store
            .requeue_stale(Duration::from_secs(600), 3)
            .await
            .unwrap();
        assert_eq!(swept.len(), 2);

        let retryable = store.get(retryable.id).await.unwrap().unwrap();
        assert_eq!(retryable.status, JobStatus::Retrying);
        assert_eq!(retryable.last_error.as_deref(), Some(STALE_CLAIM_ERROR));
        assert!(retryable.is_claimable(Utc::now()));

        let exhausted = store.get(exhausted.id).await.unwrap().unwrap();
        assert_eq!(exhausted.status, JobStatus::Failed);

        let fresh = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn oversized_durations_saturate() {
        let store = InMemoryQueueStore::new();
        let id = store.enqueue(new_job("r1.pdf")).await.unwrap();
        store.claim_next(1).await.unwrap();

        // A threshold longer than the calendar never makes a fresh claim stale.
        let swept = store
            .requeue_stale(Duration::from_millis(u64::MAX), 3)
            .await
            .unwrap();
        assert!(swept.is_empty());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );

        let outcome = store
            .mark_retrying(id, "x", Duration::from_millis(10u64.pow(16)))
            .await
            .unwrap();
        let job = outcome.applied().unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.next_attempt_at, Some(chrono::DateTime::<Utc>::MAX_UTC));
        assert!(store.claim_next(1).await.unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 48,
            ..ProptestConfig::default()
        })]

        /// Property: concurrent claimers never receive the same job id, and
        /// together they claim every eligible job exactly once.
        #[test]
        fn concurrent_claims_never_duplicate(
            jobs in 1usize..40,
            workers in 2usize..8,
            limit in 1usize..5,
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .build()
                .unwrap();

            let (claimed, total) = rt.block_on(async move {
                let store = InMemoryQueueStore::arc();
                for i in 0..jobs {
                    store.enqueue(new_job(&format!("r{i}.pdf"))).await.unwrap();
                }

                let mut tasks = Vec::new();
                for _ in 0..workers {
                    let store = store.clone();
                    tasks.push(tokio::spawn(async move {
                        let mut mine = Vec::new();
                        loop {
                            let batch = store.claim_next(limit).await.unwrap();
                            if batch.is_empty() {
                                break;
                            }
                            mine.extend(batch.into_iter().map(|j| j.id));
                            tokio::task::yield_now().await;
                        }
                        mine
                    }));
                }

                let mut all = Vec::new();
                for task in tasks {
                    all.extend(task.await.unwrap());
                }
                (all, jobs)
            });

            let unique: HashSet<_> = claimed.iter().copied().collect();
            prop_assert_eq!(unique.len(), claimed.len());
            prop_assert_eq!(claimed.len(), total);
        }
    }
}
