//! Error types for chartflow.

use crate::model::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job already completed: {0}")]
    AlreadyCompleted(JobId),

    #[error("job already exists for idempotency key {0}")]
    AlreadyExists(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("enrichment lookup failed: {0}")]
    Enrichment(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether redelivering the message that produced this error may succeed.
    ///
    /// Store and lookup failures are transient. Everything else is a
    /// property of the message or the job and will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Enrichment(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
