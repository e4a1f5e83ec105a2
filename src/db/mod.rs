//! Database connection pool, migrations, and health check.
//!
//! One Postgres pool backs the job registry, the item store, and the pgmq
//! queues, so queue sends can share a transaction with table writes.

pub mod items;
pub mod jobs;
pub mod pgmq;

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{
    Attributes, IncrementResult, InboundMessage, Item, ItemId, Job, JobFilter, JobId, NewJob,
    UpsertResult,
};
use crate::store::{ItemStore, JobDispatch, JobStore, MessageQueue};

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Check that the database answers and the pgmq extension is usable.
    pub async fn health_check(&self) -> Result<()> {
        let (version,): (String,) =
            sqlx::query_as("SELECT extversion FROM pg_extension WHERE extname = 'pgmq'")
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::Other("pgmq extension is not installed".to_string()))?;
        debug!(pgmq = %version, "database healthy");
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl JobStore for Db {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        Db::create_job(self, new).await
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        Db::get_job(self, id).await
    }

    async fn increment(&self, id: JobId) -> Result<IncrementResult> {
        Db::increment_processed(self, id).await
    }

    async fn mark_notified(&self, id: JobId) -> Result<()> {
        Db::mark_notified(self, id).await
    }

    async fn claim_notifications(
        &self,
        completed_before: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<Job>> {
        Db::claim_notifications(self, completed_before, lease, limit).await
    }

    async fn discard_job(&self, id: JobId) -> Result<bool> {
        Db::discard_job(self, id).await
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        Db::list_jobs(self, &filter).await
    }
}

impl JobDispatch for Db {
    async fn create_job_with_messages(
        &self,
        new: NewJob,
        queue: &str,
        bodies: &[serde_json::Value],
    ) -> Result<Job> {
        Db::create_job_with_messages(self, new, queue, bodies).await
    }
}

impl ItemStore for Db {
    async fn upsert_item(&self, id: &ItemId, attributes: &Attributes) -> Result<UpsertResult> {
        Db::upsert_item(self, id, attributes).await
    }

    async fn get_item(&self, id: &ItemId) -> Result<Option<Item>> {
        Db::get_item(self, id).await
    }
}

impl MessageQueue for Db {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        Db::create_queue(self, queue).await
    }

    async fn send(&self, queue: &str, body: &serde_json::Value) -> Result<i64> {
        self.send_to_queue(queue, body).await
    }

    async fn read_batch(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        qty: usize,
        max_wait: Duration,
    ) -> Result<Vec<InboundMessage>> {
        let messages = self
            .read_with_poll(queue, visibility_timeout, qty, max_wait)
            .await?;
        Ok(messages.into_iter().map(InboundMessage::from).collect())
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> Result<()> {
        self.archive_message(queue, msg_id).await
    }
}
