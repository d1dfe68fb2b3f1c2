//! `hireloop-core`: upload queue domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! job records, their state machine, identifiers and the retry policy.

pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use error::{QueueError, QueueResult};
pub use id::{CandidateRef, JobId};
pub use job::{JobStatus, NewUploadJob, UploadQueueJob, claim_order, snapshot_order};
pub use retry::{RetryPolicy, cutoff_before, deadline_after};
