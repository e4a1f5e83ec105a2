//! Batch processing of item messages.
//!
//! Each message in a batch runs on its own task and gets its own outcome,
//! so one bad message never holds back or fails its siblings. The job
//! counter is the only place completion is decided.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, info, warn};

use crate::enrich::Enricher;
use crate::error::{Error, Result};
use crate::event::JobCompleted;
use crate::model::{InboundMessage, ItemId, JobId, merge_attributes};
use crate::notifier::CompletionNotifier;
use crate::store::{ItemStore, JobStore};
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_disposition, start_message_span};

/// Upper bound on completion events republished per sweep.
const REPUBLISH_LIMIT: i64 = 100;

/// How long a sweep's claim on a pending completion keeps other sweeps
/// away. A claim whose event could not be fired is retried after this.
const CLAIM_LEASE: Duration = Duration::from_secs(60);

/// What happened to one message, and what the transport should do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageDisposition {
    /// Item stored and counted. Ack.
    Processed {
        job_id: JobId,
        item_id: ItemId,
        created: bool,
        /// This message completed the job.
        completed: bool,
    },
    /// The job had already completed; a redelivery. Ack.
    Duplicate { job_id: JobId },
    /// Transient failure. Leave it for redelivery.
    Retry { error: String },
    /// Will never succeed. Move to the dead-letter queue.
    DeadLetter { reason: String },
}

impl MessageDisposition {
    pub fn label(&self) -> &'static str {
        match self {
            MessageDisposition::Processed { .. } => "processed",
            MessageDisposition::Duplicate { .. } => "duplicate",
            MessageDisposition::Retry { .. } => "retry",
            MessageDisposition::DeadLetter { .. } => "dead_letter",
        }
    }

    /// Whether the transport should acknowledge (archive) the message.
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            MessageDisposition::Processed { .. } | MessageDisposition::Duplicate { .. }
        )
    }
}

/// Outcome of one message in a batch.
#[derive(Debug, Clone)]
pub struct MessageOutcome {
    pub msg_id: i64,
    pub disposition: MessageDisposition,
}

/// Per-message outcomes of a batch, in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<MessageOutcome>,
}

impl BatchReport {
    fn count(&self, label: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.disposition.label() == label)
            .count()
    }

    pub fn processed(&self) -> usize {
        self.count("processed")
    }

    pub fn duplicates(&self) -> usize {
        self.count("duplicate")
    }

    pub fn dead_lettered(&self) -> usize {
        self.count("dead_letter")
    }

    /// Message IDs the transport should redeliver.
    pub fn retry_ids(&self) -> Vec<i64> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.disposition, MessageDisposition::Retry { .. }))
            .map(|o| o.msg_id)
            .collect()
    }

    /// Jobs completed by messages in this batch.
    pub fn completed_jobs(&self) -> Vec<JobId> {
        self.outcomes
            .iter()
            .filter_map(|o| match o.disposition {
                MessageDisposition::Processed {
                    job_id,
                    completed: true,
                    ..
                } => Some(job_id),
                _ => None,
            })
            .collect()
    }
}

/// Applies item messages to the item store and the job counter.
pub struct BatchProcessor<S, N, E> {
    store: Arc<S>,
    notifier: Arc<N>,
    enricher: Arc<E>,
    max_deliveries: u32,
}

impl<S, N, E> Clone for BatchProcessor<S, N, E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier),
            enricher: Arc::clone(&self.enricher),
            max_deliveries: self.max_deliveries,
        }
    }
}

impl<S, N, E> BatchProcessor<S, N, E>
where
    S: JobStore + ItemStore + 'static,
    N: CompletionNotifier + 'static,
    E: Enricher + 'static,
{
    pub fn new(store: Arc<S>, notifier: Arc<N>, enricher: Arc<E>, max_deliveries: u32) -> Self {
        Self {
            store,
            notifier,
            enricher,
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Process every message of a batch concurrently and independently.
    pub async fn process_batch(&self, batch: Vec<InboundMessage>) -> BatchReport {
        let handles: Vec<_> = batch
            .into_iter()
            .map(|msg| {
                let this = self.clone();
                let msg_id = msg.msg_id;
                let span = start_message_span(msg_id, msg.delivery_attempt);
                let handle = tokio::spawn(
                    async move { this.process_message(&msg).await }.instrument(span),
                );
                (msg_id, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (msg_id, handle) in handles {
            let disposition = match handle.await {
                Ok(d) => d,
                Err(e) => {
                    error!(msg_id, "message task failed: {e}");
                    MessageDisposition::Retry {
                        error: format!("message task failed: {e}"),
                    }
                }
            };
            outcomes.push(MessageOutcome {
                msg_id,
                disposition,
            });
        }

        BatchReport { outcomes }
    }

    /// Process one message. Never fails: every error becomes a disposition.
    pub async fn process_message(&self, msg: &InboundMessage) -> MessageDisposition {
        let disposition = match self.handle(msg).await {
            Ok(d) => d,
            Err(e) => self.classify(e, msg.delivery_attempt),
        };

        metrics::message_dispositions()
            .add(1, &[KeyValue::new("disposition", disposition.label())]);
        record_disposition(&tracing::Span::current(), disposition.label());
        disposition
    }

    async fn handle(&self, msg: &InboundMessage) -> Result<MessageDisposition> {
        let envelope = msg.parse()?;
        let job_id = envelope.job_id;
        tracing::Span::current().record("message.job_id", tracing::field::display(job_id));

        let item_id = envelope.track.identity();
        let mut attributes = envelope.track.attributes();
        let enriched = self.enricher.enrich(&envelope.track).await?;
        merge_attributes(&mut attributes, &enriched);

        let upsert = self.store.upsert_item(&item_id, &attributes).await?;
        debug!(%item_id, created = upsert.created, "item upserted");

        // Counts messages, not distinct items: a redelivered or repeated
        // track still moves the counter.
        let counted = match self.store.increment(job_id).await {
            Ok(r) => r,
            Err(Error::AlreadyCompleted(id)) => {
                info!(job_id = %id, "job already completed, ignoring redelivery");
                return Ok(MessageDisposition::Duplicate { job_id: id });
            }
            Err(e) => return Err(e),
        };

        if counted.crossed_completion {
            info!(
                job_id = %job_id,
                processed = counted.new_processed,
                expected = counted.expected,
                "job completed"
            );
            self.notify(job_id, "inline").await;
        }

        Ok(MessageDisposition::Processed {
            job_id,
            item_id: upsert.item_id,
            created: upsert.created,
            completed: counted.crossed_completion,
        })
    }

    /// Fire the completion event and stamp the job.
    ///
    /// A failure here is logged and left for [`Self::republish_pending`]:
    /// the message that completed the job has already been counted and must
    /// not be retried.
    async fn notify(&self, job_id: JobId, path: &'static str) -> bool {
        let fired: Result<()> = async {
            let job = self.store.get_job(job_id).await?;
            let event = JobCompleted::from_job(&job)?;
            self.notifier.fire(&event).await?;
            self.store.mark_notified(job_id).await
        }
        .await;

        let result = if fired.is_ok() { "ok" } else { "error" };
        metrics::completions_fired().add(
            1,
            &[KeyValue::new("result", result), KeyValue::new("path", path)],
        );
        if let Err(e) = &fired {
            error!(job_id = %job_id, path, "completion notification failed: {e}");
        }
        fired.is_ok()
    }

    /// Re-fire completion events that were never handed off.
    ///
    /// Only jobs that completed more than `grace` ago are considered, to
    /// stay clear of a worker that is about to fire inline. Each job is
    /// claimed first, so concurrent sweeps never fire the same one. Returns
    /// how many events were delivered.
    pub async fn republish_pending(&self, grace: Duration) -> Result<usize> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| Error::Other(format!("invalid grace period: {e}")))?;
        let pending = self
            .store
            .claim_notifications(Utc::now() - grace, CLAIM_LEASE, REPUBLISH_LIMIT)
            .await?;

        let mut delivered = 0;
        for job in pending {
            warn!(job_id = %job.id, "republishing completion event");
            if self.notify(job.id, "republish").await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn classify(&self, err: Error, delivery_attempt: u32) -> MessageDisposition {
        if err.is_retryable() {
            if delivery_attempt >= self.max_deliveries {
                error!(delivery_attempt, "giving up on message: {err}");
                return MessageDisposition::DeadLetter {
                    reason: format!("gave up after {delivery_attempt} deliveries: {err}"),
                };
            }
            warn!(delivery_attempt, "message will be retried: {err}");
            return MessageDisposition::Retry {
                error: err.to_string(),
            };
        }

        match &err {
            Error::JobNotFound(id) => {
                error!(job_id = %id, "message references unknown job, routing to inspection");
            }
            _ => warn!("dead-lettering message: {err}"),
        }
        MessageDisposition::DeadLetter {
            reason: err.to_string(),
        }
    }
}
