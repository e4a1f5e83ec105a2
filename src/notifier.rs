//! Completion notification.
//!
//! The counter guarantees at most one caller per job is told it crossed the
//! completion threshold, so notifiers do no deduplication of their own.
//! Re-publishing after a failed hand-off may emit an event twice; consumers
//! deduplicate on `job_id`.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::event::JobCompleted;

/// Channel used for `pg_notify` when a job completes.
pub const COMPLETION_CHANNEL: &str = "job_completed";

/// Emits the downstream completion signal for a job.
pub trait CompletionNotifier: Send + Sync {
    fn fire(&self, event: &JobCompleted) -> impl Future<Output = Result<()>> + Send;
}

/// Publishes completion events to a pgmq queue and wakes listeners with
/// `pg_notify`, in one transaction.
pub struct PgNotifier {
    db: Arc<Db>,
    queue: String,
}

impl PgNotifier {
    pub fn new(db: Arc<Db>, queue: impl Into<String>) -> Self {
        Self {
            db,
            queue: queue.into(),
        }
    }
}

impl CompletionNotifier for PgNotifier {
    async fn fire(&self, event: &JobCompleted) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        let msg_id = self
            .db
            .send_and_notify(&self.queue, &payload, COMPLETION_CHANNEL, &event.idempotency_key())
            .await?;
        info!(
            job_id = %event.job_id,
            queue = %self.queue,
            msg_id,
            "completion event published"
        );
        Ok(())
    }
}

/// Keeps fired events in memory. Can be told to fail the next N fires.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<JobCompleted>>,
    failures_remaining: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `fire` fail without recording.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<JobCompleted> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CompletionNotifier for RecordingNotifier {
    async fn fire(&self, event: &JobCompleted) -> Result<()> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Other(format!(
                "completion sink unavailable for job {}",
                event.job_id
            )));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
