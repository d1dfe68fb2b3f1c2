//! Postgres-backed queue store.
//!
//! The `upload_queue` table is the single source of truth for job state. Every
//! transition is one conditional `UPDATE`, so concurrent workers in different
//! processes coordinate through row locks instead of in-process locking.
//!
//! ## Claiming
//!
//! `claim_next` selects eligible rows with `FOR UPDATE SKIP LOCKED` inside the
//! same statement that flips them to `processing`. Two concurrent claimers can
//! never lock the same row, and neither blocks on the other's batch.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (integrity) | `23xxx` | `Constraint` |
//! | Database (other) | Any other | `Unavailable` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Decode` |
//!
//! `enqueue` checks for a unique violation (`23505`) itself and reports it as
//! `AlreadyExists` with the id it tried to insert.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use hireloop_core::{CandidateRef, JobId, JobStatus, UploadQueueJob, claim_order};

use super::store::{MarkOutcome, QueueStore, STALE_CLAIM_ERROR, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_upload_queue.sql");

const JOB_COLUMNS: &str = "id, candidate_ref, filename, status, attempts, last_error, \
                           next_attempt_at, upload_date, updated_at";

/// Postgres-backed queue store.
///
/// Cheap to clone; all clones share the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    /// Create a new PostgresQueueStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` and build a store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the `upload_queue` schema (idempotent).
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Resolve a conditional update that matched no row: missing job or conflict.
    async fn resolve_miss(&self, id: JobId) -> Result<MarkOutcome, StoreError> {
        let row = sqlx::query("SELECT status FROM upload_queue WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("resolve_miss", e))?;

        match row {
            None => Err(StoreError::NotFound(id)),
            Some(row) => {
                let raw: String = row
                    .try_get("status")
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                let current = raw
                    .parse::<JobStatus>()
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                Ok(MarkOutcome::Conflict { current })
            }
        }
    }

    async fn finish_mark(
        &self,
        id: JobId,
        row: Option<PgRow>,
    ) -> Result<MarkOutcome, StoreError> {
        match row {
            Some(row) => Ok(MarkOutcome::Applied(JobRow::from_row(&row)?.into_job()?)),
            None => self.resolve_miss(id).await,
        }
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn enqueue(&self, job: UploadQueueJob) -> Result<JobId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO upload_queue
                (id, candidate_ref, filename, status, attempts, upload_date, updated_at)
            VALUES ($1, $2, $3, 'queued', 0, $4, $4)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.candidate_ref.as_str())
        .bind(&job.filename)
        .bind(job.upload_date)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<UploadQueueJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM upload_queue WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| JobRow::from_row(&r)?.into_job()).transpose()
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn claim_next(&self, limit: usize) -> Result<Vec<UploadQueueJob>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            WITH eligible AS (
                SELECT id
                FROM upload_queue
                WHERE status = 'queued'
                   OR (status = 'retrying'
                       AND (next_attempt_at IS NULL OR next_attempt_at <= NOW()))
                ORDER BY upload_date ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE upload_queue AS q
            SET status = 'processing',
                attempts = q.attempts + 1,
                last_error = NULL,
                next_attempt_at = NULL,
                updated_at = NOW()
            FROM eligible
            WHERE q.id = eligible.id
            RETURNING {}
            "#,
            prefixed_columns("q")
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let mut jobs = decode_rows(&rows)?;
        // RETURNING order is unspecified.
        jobs.sort_by(claim_order);
        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_succeeded(&self, id: JobId) -> Result<MarkOutcome, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE upload_queue
            SET status = 'succeeded', last_error = NULL, next_attempt_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_succeeded", e))?;

        self.finish_mark(id, row).await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<MarkOutcome, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE upload_queue
            SET status = 'failed', last_error = $2, next_attempt_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(error)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        self.finish_mark(id, row).await
    }

    #[instrument(skip(self, error), fields(job_id = %id, retry_after_ms = retry_after.as_millis() as u64), err)]
    async fn mark_retrying(
        &self,
        id: JobId,
        error: &str,
        retry_after: Duration,
    ) -> Result<MarkOutcome, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE upload_queue
            SET status = 'retrying',
                last_error = $2,
                next_attempt_at = NOW() + ($3::bigint * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(error)
        .bind(duration_millis(retry_after))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_retrying", e))?;

        self.finish_mark(id, row).await
    }

    #[instrument(skip(self), fields(swept = tracing::field::Empty), err)]
    async fn requeue_stale(
        &self,
        stale_after: Duration,
        max_attempts: u32,
    ) -> Result<Vec<UploadQueueJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE upload_queue
            SET status = CASE WHEN attempts >= $2 THEN 'failed' ELSE 'retrying' END,
                last_error = $3,
                next_attempt_at = CASE WHEN attempts >= $2 THEN NULL ELSE NOW() END,
                updated_at = NOW()
            WHERE status = 'processing'
              AND updated_at < NOW() - ($1::bigint * INTERVAL '1 millisecond')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(duration_millis(stale_after))
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(STALE_CLAIM_ERROR)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        let mut jobs = decode_rows(&rows)?;
        jobs.sort_by(claim_order);
        Span::current().record("swept", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn snapshot(&self) -> Result<Vec<UploadQueueJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM upload_queue ORDER BY upload_date DESC, id DESC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("snapshot", e))?;

        decode_rows(&rows)
    }
}

fn prefixed_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Longest interval handed to SQL; `NOW() +/- interval` stays inside the timestamp range.
const MAX_INTERVAL_MILLIS: i64 = 1_000 * 365 * 24 * 60 * 60 * 1_000;

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis())
        .unwrap_or(i64::MAX)
        .min(MAX_INTERVAL_MILLIS)
}

fn decode_rows(rows: &[PgRow]) -> Result<Vec<UploadQueueJob>, StoreError> {
    rows.iter()
        .map(|row| JobRow::from_row(row)?.into_job())
        .collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some(code) if code.starts_with("23") => StoreError::Constraint(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    candidate_ref: String,
    filename: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    upload_date: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn from_row(row: &PgRow) -> Result<Self, StoreError> {
        let decode = |e: sqlx::Error| StoreError::Decode(e.to_string());
        Ok(JobRow {
            id: row.try_get("id").map_err(decode)?,
            candidate_ref: row.try_get("candidate_ref").map_err(decode)?,
            filename: row.try_get("filename").map_err(decode)?,
            status: row.try_get("status").map_err(decode)?,
            attempts: row.try_get("attempts").map_err(decode)?,
            last_error: row.try_get("last_error").map_err(decode)?,
            next_attempt_at: row.try_get("next_attempt_at").map_err(decode)?,
            upload_date: row.try_get("upload_date").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
        })
    }

    fn into_job(self) -> Result<UploadQueueJob, StoreError> {
        let decode = |e: hireloop_core::QueueError| StoreError::Decode(e.to_string());
        Ok(UploadQueueJob {
            id: JobId::from_uuid(self.id),
            candidate_ref: CandidateRef::new(self.candidate_ref).map_err(decode)?,
            filename: self.filename,
            status: self.status.parse().map_err(decode)?,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| StoreError::Decode(format!("negative attempts: {}", self.attempts)))?,
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at,
            upload_date: self.upload_date,
            updated_at: self.updated_at,
        })
    }
}
