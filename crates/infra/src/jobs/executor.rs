//! Processor Worker: claims queued uploads and drives them through the retry
//! state machine.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use hireloop_core::{JobId, RetryPolicy, UploadQueueJob};
use hireloop_observability::HealthRegistry;

use super::processor::{ProcessingError, UploadProcessor};
use super::stats::{ProcessorStats, StatsSnapshot};
use super::store::{MarkOutcome, QueueStore, StoreError};
use crate::event_bus::ChangePublisher;

const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_BASE: Duration = Duration::from_millis(100);

/// Processor Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging and the health component.
    pub name: String,
    /// How often to poll for eligible jobs
    pub poll_interval: Duration,
    /// Claim limit per cycle
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Upper bound on one processor call
    pub job_timeout: Duration,
    /// Consecutive errors tolerated before claiming pauses
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    /// `Processing` older than this is reclaimed by the sweep
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "processor-worker".to_string(),
            poll_interval: Duration::from_millis(1000),
            batch_size: 5,
            retry: RetryPolicy::default(),
            job_timeout: Duration::from_secs(120),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            stale_after: Duration::from_secs(600),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub swept: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Marks that found the job already past `Processing`.
    pub conflicts: usize,
    /// Outcome events published after the batch.
    pub published: usize,
    /// Claiming was skipped because the breaker is open.
    pub paused: bool,
}

/// Background upload processor.
///
/// Claims go through the store's own atomic update, so any number of workers
/// across processes can share one store.
pub struct ProcessorWorker {
    store: Arc<dyn QueueStore>,
    processor: Arc<dyn UploadProcessor>,
    publisher: ChangePublisher,
    config: WorkerConfig,
    health: HealthRegistry,
    stats: Mutex<ProcessorStats>,
    paused_until: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for ProcessorWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProcessorWorker {
    pub fn new(
        store: Arc<dyn QueueStore>,
        processor: Arc<dyn UploadProcessor>,
        publisher: ChangePublisher,
        config: WorkerConfig,
        health: HealthRegistry,
    ) -> Self {
        health.set_healthy(&config.name);
        Self {
            store,
            processor,
            publisher,
            config,
            health,
            stats: Mutex::new(ProcessorStats::default()),
            paused_until: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.with_stats(|s| s.snapshot())
    }

    /// Whether the circuit breaker currently blocks claiming.
    pub fn is_paused(&self) -> bool {
        self.paused_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|until| Instant::now() < until)
    }

    fn with_stats<R>(&self, f: impl FnOnce(&mut ProcessorStats) -> R) -> R {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats)
    }

    /// Run one sweep + claim + process cycle.
    ///
    /// Never fails: store and processor errors are logged, counted, and left
    /// for the next cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport {
            swept: self.sweep_stale().await,
            ..CycleReport::default()
        };

        if !self.breaker_allows_claim() {
            report.paused = true;
            return report;
        }

        let claimed = match self.store.claim_next(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(worker = %self.config.name, error = %e, "failed to claim jobs");
                self.with_stats(|s| s.record_store_error());
                return report;
            }
        };
        if claimed.is_empty() {
            return report;
        }
        report.claimed = claimed.len();
        debug!(worker = %self.config.name, claimed = claimed.len(), "claimed jobs");
        self.publisher.publish(&claimed).await;

        let mut changed = Vec::with_capacity(claimed.len());
        for job in &claimed {
            let started = Instant::now();
            let result = self.invoke_processor(job).await;

            let outcome = match result {
                Ok(()) => {
                    self.with_stats(|s| s.record_success(started.elapsed()));
                    let retried = self
                        .with_store_retry("mark_succeeded", job.id, || {
                            self.store.mark_succeeded(job.id)
                        })
                        .await;
                    if retried.as_ref().is_ok_and(|o| o.applied().is_some()) {
                        report.succeeded += 1;
                    }
                    retried
                }
                Err(e) => {
                    let streak = self.with_stats(|s| {
                        s.record_failure();
                        s.consecutive_errors()
                    });
                    let message = e.to_string();
                    let outcome = if self.config.retry.should_retry(job.attempts) {
                        let delay = self.config.retry.delay_for_attempt(job.attempts);
                        warn!(
                            job_id = %job.id,
                            attempts = job.attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %message,
                            "upload processing failed; will retry"
                        );
                        let outcome = self
                            .with_store_retry("mark_retrying", job.id, || {
                                self.store.mark_retrying(job.id, &message, delay)
                            })
                            .await;
                        if outcome.as_ref().is_ok_and(|o| o.applied().is_some()) {
                            report.retried += 1;
                        }
                        outcome
                    } else {
                        error!(
                            job_id = %job.id,
                            attempts = job.attempts,
                            error = %message,
                            "upload processing failed permanently"
                        );
                        let outcome = self
                            .with_store_retry("mark_failed", job.id, || {
                                self.store.mark_failed(job.id, &message)
                            })
                            .await;
                        if outcome.as_ref().is_ok_and(|o| o.applied().is_some()) {
                            report.failed += 1;
                        }
                        outcome
                    };
                    self.maybe_trip_breaker(streak);
                    outcome
                }
            };

            match outcome {
                Ok(MarkOutcome::Applied(job)) => changed.push(job),
                Ok(MarkOutcome::Conflict { current }) => {
                    report.conflicts += 1;
                    debug!(job_id = %job.id, current = %current, "job already resolved elsewhere");
                }
                Err(e) => {
                    // Left in Processing; the staleness sweep reclaims it.
                    error!(job_id = %job.id, error = %e, "failed to record job outcome");
                    self.with_stats(|s| s.record_store_error());
                }
            }
        }

        for job in &changed {
            if self.publisher.publish(std::slice::from_ref(job)).await {
                report.published += 1;
            }
        }
        report
    }

    async fn invoke_processor(&self, job: &UploadQueueJob) -> Result<(), ProcessingError> {
        let call = AssertUnwindSafe(self.processor.process(job)).catch_unwind();
        match tokio::time::timeout(self.config.job_timeout, call).await {
            Err(_) => Err(ProcessingError::TimedOut(self.config.job_timeout)),
            Ok(Err(panic)) => Err(ProcessingError::Panicked(panic_message(panic.as_ref()))),
            Ok(Ok(result)) => result,
        }
    }

    async fn sweep_stale(&self) -> usize {
        match self
            .store
            .requeue_stale(self.config.stale_after, self.config.retry.max_attempts)
            .await
        {
            Ok(swept) if swept.is_empty() => 0,
            Ok(swept) => {
                warn!(
                    worker = %self.config.name,
                    swept = swept.len(),
                    "reclaimed stale processing jobs"
                );
                self.publisher.publish(&swept).await;
                swept.len()
            }
            Err(e) => {
                warn!(worker = %self.config.name, error = %e, "staleness sweep failed");
                self.with_stats(|s| s.record_store_error());
                0
            }
        }
    }

    fn breaker_allows_claim(&self) -> bool {
        let mut paused = self.paused_until.lock().unwrap_or_else(PoisonError::into_inner);
        match *paused {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                *paused = None;
                self.health.set_healthy(&self.config.name);
                info!(worker = %self.config.name, "circuit breaker closed; resuming claims");
                true
            }
            None => true,
        }
    }

    fn maybe_trip_breaker(&self, consecutive_errors: u32) {
        if consecutive_errors <= self.config.breaker_threshold {
            return;
        }
        let mut paused = self.paused_until.lock().unwrap_or_else(PoisonError::into_inner);
        if paused.is_some() {
            return;
        }
        *paused = Some(Instant::now() + self.config.breaker_cooldown);
        self.health.set_degraded(
            &self.config.name,
            format!("circuit breaker open after {consecutive_errors} consecutive errors"),
        );
        warn!(
            worker = %self.config.name,
            consecutive_errors,
            cooldown_ms = self.config.breaker_cooldown.as_millis() as u64,
            "circuit breaker tripped; pausing claims"
        );
    }

    async fn with_store_retry<F, Fut>(
        &self,
        operation: &'static str,
        job_id: JobId,
        mut call: F,
    ) -> Result<MarkOutcome, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<MarkOutcome, StoreError>>,
    {
        let mut delay = STORE_RETRY_BASE;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < STORE_RETRY_ATTEMPTS => {
                    warn!(
                        job_id = %job_id,
                        operation,
                        attempt,
                        error = %e,
                        "store mutation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Spawn the worker loop on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let worker = Arc::new(self);
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker_loop(worker.clone(), shutdown_rx, wake.clone()));

        WorkerHandle {
            worker,
            wake,
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn worker_loop(
    worker: Arc<ProcessorWorker>,
    mut shutdown: watch::Receiver<bool>,
    wake: Arc<Notify>,
) {
    let name = worker.config.name.clone();
    info!(worker = %name, "processor worker started");

    let mut ticker = tokio::time::interval(worker.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }

        let report = worker.run_cycle().await;
        if report.claimed > 0 || report.swept > 0 {
            debug!(
                worker = %name,
                claimed = report.claimed,
                succeeded = report.succeeded,
                retried = report.retried,
                failed = report.failed,
                swept = report.swept,
                "cycle finished"
            );
        }
    }

    info!(worker = %name, "processor worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    worker: Arc<ProcessorWorker>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Run a cycle now instead of at the next poll tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// The wake signal, for `UploadQueue::with_wake`.
    pub fn wake_signal(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn worker(&self) -> Arc<ProcessorWorker> {
        self.worker.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.worker.stats()
    }

    pub fn is_paused(&self) -> bool {
        self.worker.is_paused()
    }

    /// Stop after the current batch and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "processor worker task ended abnormally");
        }
    }
}
