//! Upload queue job: the unit of résumé ingestion work and its state machine.

use core::cmp::Ordering;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::id::{CandidateRef, JobId};

/// Job lifecycle status.
///
/// `Queued/Retrying -> Processing -> {Succeeded | Retrying | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Registered, waiting for its first claim
    Queued,
    /// Claimed by exactly one worker
    Processing,
    /// Processed successfully (terminal)
    Succeeded,
    /// Exhausted its attempts (terminal)
    Failed,
    /// Failed, eligible again once its backoff elapses
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    /// Storage representation (the `status` column).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| QueueError::UnknownStatus(s.to_string()))
    }
}

/// Input for registering a new upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUploadJob {
    pub candidate_ref: CandidateRef,
    pub filename: String,
}

impl NewUploadJob {
    pub fn new(
        candidate_ref: CandidateRef,
        filename: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let filename = filename.into();
        if filename.trim().is_empty() {
            return Err(QueueError::validation("filename must not be empty"));
        }
        Ok(Self {
            candidate_ref,
            filename,
        })
    }
}

/// A persisted upload queue job.
///
/// The JSON form (camelCase) is what socket clients receive inside the
/// `{"type":"queue","data":[...]}` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQueueJob {
    pub id: JobId,
    pub candidate_ref: CandidateRef,
    pub filename: String,
    pub status: JobStatus,
    /// Claims so far; incremented by each claim.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time a `Retrying` job may be claimed again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub upload_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadQueueJob {
    /// Build the initial `Queued` record for a new upload.
    pub fn new(input: NewUploadJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            candidate_ref: input.candidate_ref,
            filename: input.filename,
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            upload_date: now,
            updated_at: now,
        }
    }

    /// Queued, or Retrying with its backoff elapsed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => true,
            JobStatus::Retrying => self.next_attempt_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Processing since before `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.updated_at < stale_before
    }

    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        if !matches!(self.status, JobStatus::Queued | JobStatus::Retrying) {
            return Err(self.transition_error(JobStatus::Processing));
        }
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.last_error = None;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.require_processing(JobStatus::Succeeded)?;
        self.status = JobStatus::Succeeded;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn retry(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.require_processing(JobStatus::Retrying)?;
        self.status = JobStatus::Retrying;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.require_processing(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.last_error = Some(error.into());
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn require_processing(&self, to: JobStatus) -> Result<(), QueueError> {
        if self.status == JobStatus::Processing {
            Ok(())
        } else {
            Err(self.transition_error(to))
        }
    }

    fn transition_error(&self, to: JobStatus) -> QueueError {
        QueueError::InvalidTransition {
            from: self.status.as_str(),
            to: to.as_str(),
        }
    }
}

/// Snapshot order: `upload_date` descending, ties broken by `id` descending.
pub fn snapshot_order(a: &UploadQueueJob, b: &UploadQueueJob) -> Ordering {
    b.upload_date
        .cmp(&a.upload_date)
        .then_with(|| b.id.cmp(&a.id))
}

/// Claim order: oldest upload first.
pub fn claim_order(a: &UploadQueueJob, b: &UploadQueueJob) -> Ordering {
    a.upload_date
        .cmp(&b.upload_date)
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_job(filename: &str) -> UploadQueueJob {
        let input = NewUploadJob::new(CandidateRef::new("cand-1").unwrap(), filename).unwrap();
        UploadQueueJob::new(input, Utc::now())
    }

    #[test]
    fn new_job_is_queued_with_zero_attempts() {
        let job = new_job("r1.pdf");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
        assert_eq!(job.upload_date, job.updated_at);
    }

    #[test]
    fn empty_filename_is_rejected() {
        let err = NewUploadJob::new(CandidateRef::new("cand-1").unwrap(), "").unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn claim_increments_attempts_and_clears_error() {
        let mut job = new_job("r1.pdf");
        let now = Utc::now();
        job.claim(now).unwrap();
        job.retry("parser crashed", now, now).unwrap();
        assert_eq!(job.last_error.as_deref(), Some("parser crashed"));

        job.claim(now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.is_none());
        assert!(job.next_attempt_at.is_none());
    }

    #[test]
    fn retrying_job_waits_for_backoff() {
        let mut job = new_job("r1.pdf");
        let now = Utc::now();
        job.claim(now).unwrap();
        job.retry("boom", now + Duration::seconds(10), now).unwrap();

        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + Duration::seconds(10)));
    }

    #[test]
    fn terminal_states_do_not_transition() {
        let now = Utc::now();

        let mut failed = new_job("a.pdf");
        failed.claim(now).unwrap();
        failed.fail("bad document", now).unwrap();
        assert!(failed.claim(now).is_err());
        assert!(failed.succeed(now).is_err());
        assert_eq!(failed.status, JobStatus::Failed);

        let mut done = new_job("b.pdf");
        done.claim(now).unwrap();
        done.succeed(now).unwrap();
        assert!(done.claim(now).is_err());
        assert!(done.retry("late", now, now).is_err());
        assert_eq!(done.status, JobStatus::Succeeded);
    }

    #[test]
    fn outcome_requires_processing() {
        let mut job = new_job("r1.pdf");
        let err = job.succeed(Utc::now()).unwrap_err();
        assert_eq!(
            err,
            QueueError::InvalidTransition {
                from: "queued",
                to: "succeeded"
            }
        );
    }

    #[test]
    fn stale_only_applies_to_processing() {
        let now = Utc::now();
        let mut job = new_job("r1.pdf");
        assert!(!job.is_stale(now + Duration::hours(1)));
        job.claim(now).unwrap();
        assert!(job.is_stale(now + Duration::seconds(1)));
        assert!(!job.is_stale(now));
    }

    #[test]
    fn status_parses_from_storage_form() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("archived".parse::<JobStatus>().is_err());
    }

    #[test]
    fn snapshot_order_is_newest_first() {
        let t = Utc::now();
        let mut j1 = new_job("r1.pdf");
        j1.upload_date = t;
        let mut j2 = new_job("r2.pdf");
        j2.upload_date = t + Duration::seconds(1);

        let mut jobs = vec![j1.clone(), j2.clone()];
        jobs.sort_by(snapshot_order);
        assert_eq!(jobs[0].id, j2.id);
        assert_eq!(jobs[1].id, j1.id);

        jobs.sort_by(claim_order);
        assert_eq!(jobs[0].id, j1.id);
    }

    #[test]
    fn json_uses_camel_case_and_omits_absent_error() {
        let job = new_job("r1.pdf");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["candidateRef"], "cand-1");
        assert_eq!(value["status"], "Queued");
        assert_eq!(value["attempts"], 0);
        assert!(value.get("lastError").is_none());
        assert!(value.get("uploadDate").is_some());
    }
}
