//! Upload queue: persistence, enqueue, and background processing.
//!
//! ## Components
//!
//! - `QueueStore`: atomic, status-conditional job persistence (in-memory or Postgres)
//! - `UploadQueue`: enqueue facade that announces new jobs
//! - `ProcessorWorker`: claims jobs and drives retry/backoff
//! - `UploadProcessor`: the external processing step
//! - `ProcessorStats`: process-local counters and latency window

pub mod executor;
pub mod postgres;
pub mod processor;
pub mod queue;
pub mod stats;
pub mod store;

pub use executor::{CycleReport, ProcessorWorker, WorkerConfig, WorkerHandle};
pub use postgres::PostgresQueueStore;
pub use processor::{HttpUploadProcessor, ProcessingError, UploadProcessor};
pub use queue::UploadQueue;
pub use stats::{ProcessorStats, StatsSnapshot};
pub use store::{InMemoryQueueStore, MarkOutcome, QueueStore, STALE_CLAIM_ERROR, StoreError};
