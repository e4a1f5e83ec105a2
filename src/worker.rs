//! Worker loop: read item batches, process them, settle each message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{Instrument, info, warn};

use crate::enrich::Enricher;
use crate::error::Result;
use crate::model::InboundMessage;
use crate::notifier::CompletionNotifier;
use crate::processor::{BatchProcessor, BatchReport, MessageDisposition};
use crate::store::{ItemStore, JobStore, MessageQueue};
use crate::telemetry::metrics;
use crate::telemetry::spans::start_batch_span;

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub item_queue: String,
    pub dead_letter_queue: String,
    /// Maximum messages per batch.
    pub batch_size: usize,
    /// Maximum wait for the first message of a batch.
    pub batch_wait: Duration,
    /// How long a read message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    /// Deliveries after which a retryable failure is dead-lettered.
    pub max_deliveries: u32,
    /// How often to look for completion events that were never handed off.
    pub republish_interval: Duration,
    /// Minimum age of a completion before it is republished.
    pub republish_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            item_queue: "track_items".to_string(),
            dead_letter_queue: "track_items_dlq".to_string(),
            batch_size: 10,
            batch_wait: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(60),
            max_deliveries: 3,
            republish_interval: Duration::from_secs(30),
            republish_grace: Duration::from_secs(30),
        }
    }
}

/// One consumer of the item queue. Run as many as needed; they share
/// nothing but the store and the queue.
pub struct Worker<S, N, E, Q> {
    name: String,
    processor: BatchProcessor<S, N, E>,
    queue: Arc<Q>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S, N, E, Q> Clone for Worker<S, N, E, Q> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            processor: self.processor.clone(),
            queue: Arc::clone(&self.queue),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S, N, E, Q> Worker<S, N, E, Q>
where
    S: JobStore + ItemStore + 'static,
    N: CompletionNotifier + 'static,
    E: Enricher + 'static,
    Q: MessageQueue + 'static,
{
    pub fn new(
        name: impl Into<String>,
        processor: BatchProcessor<S, N, E>,
        queue: Arc<Q>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name: name.into(),
            processor,
            queue,
            config,
            shutdown,
        }
    }

    /// Same worker under another name, for running several in parallel.
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Run until the shutdown channel flips to `true`.
    pub async fn run(mut self) -> Result<()> {
        info!(worker = %self.name, queue = %self.config.item_queue, "worker started");
        let mut last_republish = Instant::now();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Only the read is abandoned on shutdown; a batch that has been
            // read is always settled.
            let read = self.queue.read_batch(
                &self.config.item_queue,
                self.config.visibility_timeout,
                self.config.batch_size,
                self.config.batch_wait,
            );
            let batch = tokio::select! {
                _ = self.shutdown.changed() => break,
                batch = read => batch,
            };

            match batch {
                Ok(batch) if !batch.is_empty() => {
                    let span = start_batch_span(&self.name, batch.len());
                    self.settle(batch).instrument(span).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(worker = %self.name, "queue read failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            if last_republish.elapsed() >= self.config.republish_interval {
                last_republish = Instant::now();
                match self
                    .processor
                    .republish_pending(self.config.republish_grace)
                    .await
                {
                    Ok(0) => {}
                    Ok(n) => {
                        info!(worker = %self.name, republished = n, "completion events republished")
                    }
                    Err(e) => warn!(worker = %self.name, "republish sweep failed: {e}"),
                }
            }
        }

        info!(worker = %self.name, "worker shutting down");
        Ok(())
    }

    /// Read and settle at most one batch. Returns `None` when the queue
    /// stayed empty for the whole batch window.
    pub async fn run_once(&self) -> Result<Option<BatchReport>> {
        let batch = self
            .queue
            .read_batch(
                &self.config.item_queue,
                self.config.visibility_timeout,
                self.config.batch_size,
                self.config.batch_wait,
            )
            .await?;
        if batch.is_empty() {
            return Ok(None);
        }
        let span = start_batch_span(&self.name, batch.len());
        Ok(Some(self.settle(batch).instrument(span).await))
    }

    /// Process a batch, then ack, dead-letter, or leave each message.
    ///
    /// Every message is settled on its own. A failed ack or dead-letter
    /// send is logged and leaves that message for redelivery; its siblings
    /// are still settled.
    async fn settle(&self, batch: Vec<InboundMessage>) -> BatchReport {
        let started = Instant::now();
        let originals: HashMap<i64, (u32, serde_json::Value)> = batch
            .iter()
            .map(|m| (m.msg_id, (m.delivery_attempt, m.body.clone())))
            .collect();

        let report = self.processor.process_batch(batch).await;

        let mut unsettled = 0;
        for outcome in &report.outcomes {
            let settled = match &outcome.disposition {
                d if d.is_ack() => self.ack(outcome.msg_id).await,
                MessageDisposition::DeadLetter { reason } => {
                    let (attempt, body) = originals
                        .get(&outcome.msg_id)
                        .cloned()
                        .unwrap_or((0, serde_json::Value::Null));
                    self.dead_letter(outcome.msg_id, reason, attempt, body).await
                }
                // Left alone: the visibility timeout brings it back.
                _ => Ok(()),
            };
            if let Err(e) = settled {
                unsettled += 1;
                metrics::settle_failures().add(
                    1,
                    &[KeyValue::new("disposition", outcome.disposition.label())],
                );
                warn!(
                    worker = %self.name,
                    msg_id = outcome.msg_id,
                    disposition = outcome.disposition.label(),
                    "could not settle message, leaving it for redelivery: {e}"
                );
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::batch_duration_ms()
            .record(elapsed_ms, &[KeyValue::new("worker", self.name.clone())]);
        info!(
            worker = %self.name,
            processed = report.processed(),
            duplicates = report.duplicates(),
            retries = report.retry_ids().len(),
            dead_lettered = report.dead_lettered(),
            unsettled,
            elapsed_ms,
            "batch settled"
        );

        report
    }

    async fn ack(&self, msg_id: i64) -> Result<()> {
        self.queue.archive(&self.config.item_queue, msg_id).await
    }

    /// Copy the message to the dead-letter queue, then ack the original.
    /// If the copy fails the original stays, to be dead-lettered again.
    async fn dead_letter(
        &self,
        msg_id: i64,
        reason: &str,
        delivery_attempt: u32,
        body: serde_json::Value,
    ) -> Result<()> {
        let dead = serde_json::json!({
            "msg_id": msg_id,
            "reason": reason,
            "delivery_attempt": delivery_attempt,
            "body": body,
        });
        self.queue.send(&self.config.dead_letter_queue, &dead).await?;
        self.ack(msg_id).await
    }
}
