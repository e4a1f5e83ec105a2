//! Job records and the counter contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A fan-out job: `expected` messages were dispatched for `source_ref` and
/// `processed` of them have been observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Opaque reference to the originating chart (e.g. an object key).
    pub source_ref: String,

    /// Caller-supplied key that makes creation idempotent.
    pub idempotency_key: Option<String>,

    /// Number of item messages the producer emitted. Immutable.
    pub expected: u32,

    /// Messages observed so far. Only ever moved by an atomic increment.
    pub processed: u32,

    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once, by the increment that completes the job.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set after the completion event was handed to the notifier.
    pub notified_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn remaining(&self) -> u32 {
        self.expected.saturating_sub(self.processed)
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 chars of the UUID, for terse CLI output.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|e| Error::Other(format!("invalid job id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle of a job. `Processing -> Completed` happens at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Counter result
// ---------------------------------------------------------------------------

/// Outcome of one successful `increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementResult {
    pub new_processed: u32,
    pub expected: u32,
    /// True for exactly one caller per job: the one whose increment
    /// moved `processed` to `expected` and flipped the status.
    pub crossed_completion: bool,
}

// ---------------------------------------------------------------------------
// Builder / filters
// ---------------------------------------------------------------------------

/// Builder for creating a job. The producer's entry point into the registry.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) id: JobId,
    pub(crate) source_ref: String,
    pub(crate) expected: u32,
    pub(crate) idempotency_key: Option<String>,
}

impl NewJob {
    pub fn new(source_ref: impl Into<String>, expected: u32) -> Self {
        Self {
            id: JobId::new(),
            source_ref: source_ref.into(),
            expected,
            idempotency_key: None,
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// ID the job will be stored under, known before it is created so
    /// messages can reference it.
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Reject jobs that could never complete.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.expected == 0 {
            return Err(Error::InvalidJob(
                "expected must be a positive count".to_string(),
            ));
        }
        if i32::try_from(self.expected).is_err() {
            return Err(Error::InvalidJob(format!(
                "expected count {} is too large",
                self.expected
            )));
        }
        Ok(())
    }

    /// Materialize the initial record: nothing processed yet.
    pub(crate) fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            source_ref: self.source_ref,
            idempotency_key: self.idempotency_key,
            expected: self.expected,
            processed: 0,
            status: JobStatus::Processing,
            created_at: now,
            updated_at: now,
            completed_at: None,
            notified_at: None,
        }
    }
}

/// Filters for listing jobs. `status = Processing` plus `created_before`
/// is how stalled jobs are surfaced.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            created_before: None,
            limit: 50,
        }
    }
}

impl JobFilter {
    pub(crate) fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.created_before.is_none_or(|t| job.created_at < t)
    }
}
