//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read_with_poll,
//! pgmq.archive. Job fan-out uses pgmq.send_batch from `jobs.rs`.

use std::time::Duration;

use opentelemetry::KeyValue;

use crate::error::Result;
use crate::model::InboundMessage;
use crate::telemetry::metrics;

/// How often `read_with_poll` re-checks an empty queue.
const POLL_INTERVAL_MS: i32 = 100;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub message: serde_json::Value,
}

impl From<PgmqMessage> for InboundMessage {
    fn from(msg: PgmqMessage) -> Self {
        Self {
            msg_id: msg.msg_id,
            delivery_attempt: msg.read_ct.max(1) as u32,
            body: msg.message,
        }
    }
}

/// Seconds for pgmq's integer arguments, rounded up so a short wait is
/// not turned into no wait at all.
fn whole_seconds(d: Duration) -> i32 {
    i32::try_from(d.as_millis().div_ceil(1000)).unwrap_or(i32::MAX)
}

fn record(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        record(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue_name)
            .bind(payload)
            .fetch_one(self.pool())
            .await?;
        record(queue_name, "send");
        Ok(row.0)
    }

    /// Send a message and `pg_notify` a channel in one transaction.
    /// Listeners are only woken once the message is visible.
    pub async fn send_and_notify(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        channel: &str,
        notify_payload: &str,
    ) -> Result<i64> {
        let mut tx = self.pool().begin().await?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(queue_name)
            .bind(payload)
            .fetch_one(&mut *tx)
            .await?;

        // NOTIFY is transactional: only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(notify_payload)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        record(queue_name, "send");
        Ok(row.0)
    }

    /// Read up to `qty` messages, polling for at most `max_wait` while the
    /// queue is empty. Each returned message is hidden for `visibility_timeout`.
    ///
    /// pgmq takes both durations in whole seconds; fractions round up.
    pub async fn read_with_poll(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        qty: usize,
        max_wait: Duration,
    ) -> Result<Vec<PgmqMessage>> {
        let rows: Vec<(i64, i32, serde_json::Value)> = sqlx::query_as(
            "SELECT msg_id, read_ct, message FROM pgmq.read_with_poll($1, $2, $3, $4, $5)",
        )
        .bind(queue_name)
        .bind(whole_seconds(visibility_timeout).max(1))
        .bind(qty as i32)
        .bind(whole_seconds(max_wait))
        .bind(POLL_INTERVAL_MS)
        .fetch_all(self.pool())
        .await?;

        record(
            queue_name,
            if rows.is_empty() { "read_empty" } else { "read" },
        );

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, message)| PgmqMessage {
                msg_id,
                read_ct,
                message,
            })
            .collect())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record(queue_name, "archive");
        Ok(())
    }
}
