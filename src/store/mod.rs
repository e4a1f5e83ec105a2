//! Storage and transport seams.
//!
//! The Postgres [`Db`](crate::db::Db) implements every trait here for
//! production; [`memory`] provides in-process implementations for tests
//! and local runs. All job invariants live inside the implementations'
//! single conditional update, never in callers.

pub mod memory;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    Attributes, IncrementResult, InboundMessage, Item, ItemId, Job, JobFilter, JobId, NewJob,
    UpsertResult,
};

/// Job registry plus the completion counter.
pub trait JobStore: Send + Sync {
    /// Durably create a job with `processed = 0`, `status = processing`.
    ///
    /// Fails with `AlreadyExists` if the job carries an idempotency key that
    /// was used before, and `InvalidJob` if `expected` is zero. The write has
    /// committed by the time this returns, so messages may be sent after it.
    fn create_job(&self, new: NewJob) -> impl Future<Output = Result<Job>> + Send;

    /// Read-only lookup. `JobNotFound` for unknown IDs.
    fn get_job(&self, id: JobId) -> impl Future<Output = Result<Job>> + Send;

    /// Count one processed message toward the job.
    ///
    /// Increments and, when the new count reaches `expected`, flips the
    /// status to completed, all in one conditional update guarded by
    /// `status = processing`. Exactly one caller per job sees
    /// `crossed_completion = true`. Later callers get `AlreadyCompleted`
    /// and leave the record untouched.
    fn increment(&self, id: JobId) -> impl Future<Output = Result<IncrementResult>> + Send;

    /// Record that the completion event was handed off.
    fn mark_notified(&self, id: JobId) -> impl Future<Output = Result<()>> + Send;

    /// Claim completed jobs whose completion event has not been handed off
    /// and that completed before the given instant, oldest first.
    ///
    /// A claimed job is not returned again, to this or any other caller,
    /// until `lease` has passed. Concurrent sweeps therefore split the
    /// pending jobs between them instead of each firing every event.
    fn claim_notifications(
        &self,
        completed_before: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<Job>>> + Send;

    /// Delete a job that no message has been counted toward yet.
    ///
    /// Returns `false`, leaving the job alone, if it is unknown or has
    /// progress. Used to roll back a dispatch that failed partway.
    fn discard_job(&self, id: JobId) -> impl Future<Output = Result<bool>> + Send;

    fn list_jobs(&self, filter: JobFilter) -> impl Future<Output = Result<Vec<Job>>> + Send;
}

/// Creates a job together with its item messages.
pub trait JobDispatch: Send + Sync {
    /// Create `new` and enqueue `bodies` on `queue` as one unit.
    ///
    /// On success the job and every message exist. On error no job is left
    /// behind, so a retry with the same idempotency key goes through. The
    /// bodies reference the job by [`NewJob::id`].
    fn create_job_with_messages(
        &self,
        new: NewJob,
        queue: &str,
        bodies: &[serde_json::Value],
    ) -> impl Future<Output = Result<Job>> + Send;
}

/// Content-addressed item records.
pub trait ItemStore: Send + Sync {
    /// Create the item, or merge `attributes` into the existing one.
    ///
    /// Merging only fills absent or empty fields, so concurrent upserts on
    /// the same identity converge regardless of order.
    fn upsert_item(
        &self,
        id: &ItemId,
        attributes: &Attributes,
    ) -> impl Future<Output = Result<UpsertResult>> + Send;

    fn get_item(&self, id: &ItemId) -> impl Future<Output = Result<Option<Item>>> + Send;
}

/// At-least-once, unordered message transport with visibility timeouts.
pub trait MessageQueue: Send + Sync {
    fn create_queue(&self, queue: &str) -> impl Future<Output = Result<()>> + Send;

    /// Enqueue a message body. Returns the transport's message ID.
    fn send(
        &self,
        queue: &str,
        body: &serde_json::Value,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Read up to `qty` messages, waiting at most `max_wait` for the first
    /// one. Returned messages stay hidden for `visibility_timeout` and
    /// reappear unless archived.
    fn read_batch(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        qty: usize,
        max_wait: Duration,
    ) -> impl Future<Output = Result<Vec<InboundMessage>>> + Send;

    /// Acknowledge a message so it is never redelivered.
    fn archive(&self, queue: &str, msg_id: i64) -> impl Future<Output = Result<()>> + Send;
}
