//! The completion event handed to downstream consumers.
//!
//! It is fired once per job logically, but transports may redeliver it, so
//! it carries `job_id` as the key consumers deduplicate on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobStatus};

/// Emitted when a job's last expected message has been processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: JobId,
    pub source_ref: String,
    pub expected: u32,
    pub processed: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl JobCompleted {
    /// Build the event from a job snapshot. The job must already be completed.
    pub fn from_job(job: &Job) -> Result<Self> {
        match (job.status, job.completed_at) {
            (JobStatus::Completed, Some(completed_at)) => Ok(Self {
                job_id: job.id,
                source_ref: job.source_ref.clone(),
                expected: job.expected,
                processed: job.processed,
                status: job.status,
                created_at: job.created_at,
                completed_at,
            }),
            _ => Err(Error::Other(format!(
                "job {} is not completed ({}/{})",
                job.id, job.processed, job.expected
            ))),
        }
    }

    /// Key downstream consumers deduplicate on.
    pub fn idempotency_key(&self) -> String {
        self.job_id.to_string()
    }
}
