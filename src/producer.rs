//! Fan-out: turn a chart's tracks into one job and N item messages.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::Result;
use crate::model::{ItemMessage, Job, NewJob, Track};
use crate::store::{ItemStore, JobDispatch, JobStore, MessageQueue};

/// Options for [`Producer::dispatch`].
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Makes dispatching the same chart twice fail with `AlreadyExists`.
    pub idempotency_key: Option<String>,
    /// Leave out tracks whose identity is already in the item store.
    pub skip_known: bool,
}

/// What a dispatch did.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub job: Job,
    pub total_tracks: usize,
    pub skipped_known: usize,
    pub skipped_duplicate: usize,
    pub sent: usize,
}

/// Creates jobs and enqueues their item messages.
pub struct Producer<S, D> {
    store: Arc<S>,
    dispatch: Arc<D>,
    item_queue: String,
}

impl<S, D> Producer<S, D>
where
    S: ItemStore,
    D: JobDispatch,
{
    pub fn new(store: Arc<S>, dispatch: Arc<D>, item_queue: impl Into<String>) -> Self {
        Self {
            store,
            dispatch,
            item_queue: item_queue.into(),
        }
    }

    /// Create a job for `tracks` and send one message per track.
    ///
    /// Tracks repeated within the chart (same identity) are sent once, so
    /// `expected` counts distinct tracks. Returns `None` when no track is
    /// left to send. The job and its messages are created as one unit: a
    /// failed dispatch leaves no job behind and can be retried with the
    /// same idempotency key.
    pub async fn dispatch(
        &self,
        source_ref: &str,
        tracks: Vec<Track>,
        options: DispatchOptions,
    ) -> Result<Option<DispatchReport>> {
        let total_tracks = tracks.len();
        let mut seen = HashSet::new();
        let mut skipped_known = 0;
        let mut skipped_duplicate = 0;
        let mut pending = Vec::with_capacity(tracks.len());

        for track in tracks {
            let id = track.identity();
            if !seen.insert(id.clone()) {
                skipped_duplicate += 1;
                continue;
            }
            if options.skip_known && self.store.get_item(&id).await?.is_some() {
                skipped_known += 1;
                continue;
            }
            pending.push(track);
        }

        if pending.is_empty() {
            info!(source_ref, total_tracks, "no new tracks, no job created");
            return Ok(None);
        }

        let mut new = NewJob::new(source_ref, pending.len() as u32);
        if let Some(key) = options.idempotency_key {
            new = new.idempotency_key(key);
        }
        let bodies = pending
            .into_iter()
            .map(|track| {
                serde_json::to_value(ItemMessage {
                    job_id: new.id(),
                    source_ref: source_ref.to_string(),
                    item: track,
                })
            })
            .collect::<serde_json::Result<Vec<_>>>()?;

        let job = self
            .dispatch
            .create_job_with_messages(new, &self.item_queue, &bodies)
            .await?;
        let sent = bodies.len();

        info!(
            job_id = %job.id,
            source_ref,
            total_tracks,
            skipped_known,
            skipped_duplicate,
            sent,
            "job dispatched"
        );

        Ok(Some(DispatchReport {
            job,
            total_tracks,
            skipped_known,
            skipped_duplicate,
            sent,
        }))
    }
}

/// [`JobDispatch`] for a store and a queue that share no transaction.
///
/// Creates the job first, so no worker sees a message for a job it cannot
/// find, then sends the messages one by one. If a send fails the job is
/// discarded again. Messages already sent then reference a job that no
/// longer exists and are dead-lettered by the workers.
pub struct SequentialDispatch<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
}

impl<S, Q> SequentialDispatch<S, Q> {
    pub fn new(store: Arc<S>, queue: Arc<Q>) -> Self {
        Self { store, queue }
    }
}

impl<S, Q> JobDispatch for SequentialDispatch<S, Q>
where
    S: JobStore,
    Q: MessageQueue,
{
    async fn create_job_with_messages(
        &self,
        new: NewJob,
        queue: &str,
        bodies: &[serde_json::Value],
    ) -> Result<Job> {
        let job = self.store.create_job(new).await?;

        for (sent, body) in bodies.iter().enumerate() {
            let Err(e) = self.queue.send(queue, body).await else {
                continue;
            };
            warn!(job_id = %job.id, sent, expected = job.expected, "dispatch interrupted: {e}");
            match self.store.discard_job(job.id).await {
                Ok(true) => {}
                // A worker already counted one of the sent messages.
                Ok(false) => {
                    error!(job_id = %job.id, "job has progress, left partially dispatched");
                }
                Err(discard) => {
                    error!(job_id = %job.id, "could not discard job: {discard}");
                }
            }
            return Err(e);
        }
        Ok(job)
    }
}
