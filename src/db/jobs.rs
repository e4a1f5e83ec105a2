//! Job registry and completion counter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgExecutor;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{IncrementResult, Job, JobFilter, JobId, JobStatus, NewJob};
use crate::telemetry::metrics;

const JOB_COLUMNS: &str = "id, source_ref, idempotency_key, expected, processed, status, \
                           created_at, updated_at, completed_at, notified_at";

/// Insert a fresh job. `None` when its idempotency key was used before.
async fn insert_job(conn: impl PgExecutor<'_>, job: &Job) -> Result<Option<JobRow>> {
    // ON CONFLICT only fires for a repeated idempotency key; NULL keys
    // never conflict.
    let row = sqlx::query_as(&format!(
        "INSERT INTO jobs
             (id, source_ref, idempotency_key, expected, processed, status, created_at, updated_at)
         VALUES ($1, $2, $3, $4, 0, 'processing', $5, $5)
         ON CONFLICT (idempotency_key) DO NOTHING
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(job.id.0)
    .bind(&job.source_ref)
    .bind(&job.idempotency_key)
    .bind(job.expected as i32)
    .bind(job.created_at)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

fn already_exists(job: Job) -> Error {
    let key = job.idempotency_key.unwrap_or_default();
    metrics::jobs_created().add(1, &[KeyValue::new("result", "duplicate")]);
    warn!(idempotency_key = %key, "job already exists");
    Error::AlreadyExists(key)
}

fn created(row: JobRow) -> Result<Job> {
    metrics::jobs_created().add(1, &[KeyValue::new("result", "ok")]);
    let job = row.try_into_job()?;
    info!(
        job_id = %job.id,
        expected = job.expected,
        source_ref = %job.source_ref,
        "job created"
    );
    Ok(job)
}

impl super::Db {
    /// Create a job. Returns after the insert has committed.
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        new.validate()?;
        let job = new.into_job(Utc::now());
        match insert_job(self.pool(), &job).await? {
            Some(row) => created(row),
            None => Err(already_exists(job)),
        }
    }

    /// Create a job and send its item messages in one transaction.
    ///
    /// Workers never see a message before its job row, and a failure
    /// anywhere leaves neither the job nor any message behind.
    pub async fn create_job_with_messages(
        &self,
        new: NewJob,
        queue_name: &str,
        bodies: &[serde_json::Value],
    ) -> Result<Job> {
        new.validate()?;
        let job = new.into_job(Utc::now());

        let mut tx = self.pool().begin().await?;
        let Some(row) = insert_job(&mut *tx, &job).await? else {
            return Err(already_exists(job));
        };
        let msg_ids: Vec<(i64,)> = sqlx::query_as("SELECT * FROM pgmq.send_batch($1, $2)")
            .bind(queue_name)
            .bind(bodies)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(job_id = %job.id, queue = queue_name, sent = msg_ids.len(), "job messages sent");
        metrics::queue_operations().add(
            msg_ids.len() as u64,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new("operation", "send"),
            ],
        );
        created(row)
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or(Error::JobNotFound(id))?.try_into_job()
    }

    /// Count one processed message, completing the job on the last one.
    ///
    /// The increment, the threshold test and the status flip are one
    /// statement guarded by `status = 'processing'`. Postgres serializes
    /// concurrent updates of the row and re-checks the guard against the
    /// committed version, so only the update that lands on `expected`
    /// returns `completed`, and nothing gets past it.
    pub async fn increment_processed(&self, id: JobId) -> Result<IncrementResult> {
        let now = Utc::now();
        let row: Option<(i32, i32, String)> = sqlx::query_as(
            "UPDATE jobs
             SET processed = processed + 1,
                 status = CASE WHEN processed + 1 = expected THEN 'completed' ELSE status END,
                 completed_at = CASE WHEN processed + 1 = expected THEN $2 ELSE completed_at END,
                 updated_at = $2
             WHERE id = $1 AND status = 'processing' AND processed < expected
             RETURNING processed, expected, status",
        )
        .bind(id.0)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        let Some((processed, expected, status)) = row else {
            // Guard rejected the update: either no such job or already done.
            let exists: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = $1")
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
            let result = if exists.is_some() { "already_completed" } else { "not_found" };
            metrics::job_increments().add(1, &[KeyValue::new("result", result)]);
            return Err(match exists {
                Some(_) => Error::AlreadyCompleted(id),
                None => Error::JobNotFound(id),
            });
        };

        let crossed_completion = status.parse::<JobStatus>()? == JobStatus::Completed;
        metrics::job_increments().add(
            1,
            &[KeyValue::new(
                "result",
                if crossed_completion { "completed" } else { "ok" },
            )],
        );
        debug!(job_id = %id, processed, expected, "job counter incremented");

        Ok(IncrementResult {
            new_processed: processed as u32,
            expected: expected as u32,
            crossed_completion,
        })
    }

    /// Stamp `notified_at` once. Later calls leave the first stamp.
    pub async fn mark_notified(&self, id: JobId) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE jobs SET notified_at = $2 WHERE id = $1 AND notified_at IS NULL",
        )
        .bind(id.0)
        .bind(Utc::now())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Either unknown or already stamped; only the former is an error.
            self.get_job(id).await?;
        }
        Ok(())
    }

    /// Claim completed jobs that were never handed to the notifier.
    ///
    /// Rows held by a concurrent claim are skipped, and a claim keeps the
    /// job out of other sweeps until `lease` has passed.
    pub async fn claim_notifications(
        &self,
        completed_before: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::Other(format!("invalid claim lease: {e}")))?;

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET notify_claimed_until = $3
             WHERE id IN (
                 SELECT id FROM jobs
                 WHERE status = 'completed' AND notified_at IS NULL AND completed_at < $1
                   AND (notify_claimed_until IS NULL OR notify_claimed_until <= $2)
                 ORDER BY completed_at
                 LIMIT $4
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(completed_before)
        .bind(now)
        .bind(now + lease)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(JobRow::try_into_job)
            .collect::<Result<Vec<_>>>()?;
        jobs.sort_by_key(|j| j.completed_at);
        Ok(jobs)
    }

    /// Delete a job with no progress. Returns whether a row was removed.
    pub async fn discard_job(&self, id: JobId) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM jobs WHERE id = $1 AND processed = 0")
            .bind(id.0)
            .execute(self.pool())
            .await?
            .rows_affected();
        if rows_affected > 0 {
            warn!(job_id = %id, "job discarded");
        }
        Ok(rows_affected > 0)
    }

    /// List jobs, newest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ($1::text IS NULL OR status = $1)
             AND ($2::timestamptz IS NULL OR created_at < $2)
             ORDER BY created_at DESC
             LIMIT $3"
        ))
        .bind(filter.status.map(JobStatus::as_str))
        .bind(filter.created_before)
        .bind(filter.limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    source_ref: String,
    idempotency_key: Option<String>,
    expected: i32,
    processed: i32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    notified_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            source_ref: self.source_ref,
            idempotency_key: self.idempotency_key,
            expected: self.expected as u32,
            processed: self.processed as u32,
            status: self.status.parse()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            notified_at: self.notified_at,
        })
    }
}
