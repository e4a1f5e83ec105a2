//! In-process store and queue.
//!
//! Every conditional update runs under one lock held for the whole
//! read-compare-write, which gives the same atomicity the Postgres
//! implementation gets from a single `UPDATE ... WHERE`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::{ItemStore, JobStore, MessageQueue};
use crate::error::{Error, Result};
use crate::model::{
    Attributes, IncrementResult, InboundMessage, Item, ItemId, Job, JobFilter, JobId, JobStatus,
    NewJob, UpsertResult, merge_attributes,
};

/// How often an empty `read_batch` re-checks for visible messages.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Jobs + items
// ---------------------------------------------------------------------------

/// Jobs and items held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    /// Notification claims: job -> lease expiry. Guarded by `jobs`.
    claims: Mutex<HashMap<JobId, DateTime<Utc>>>,
    items: Mutex<HashMap<ItemId, Item>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item_count(&self) -> usize {
        lock(&self.items).len()
    }
}

impl JobStore for MemoryStore {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        new.validate()?;
        let mut jobs = lock(&self.jobs);
        if let Some(key) = &new.idempotency_key {
            if jobs
                .values()
                .any(|j| j.idempotency_key.as_deref() == Some(key.as_str()))
            {
                return Err(Error::AlreadyExists(key.clone()));
            }
        }
        let job = new.into_job(Utc::now());
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        lock(&self.jobs)
            .get(&id)
            .cloned()
            .ok_or(Error::JobNotFound(id))
    }

    async fn increment(&self, id: JobId) -> Result<IncrementResult> {
        let mut jobs = lock(&self.jobs);
        let job = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        if job.status != JobStatus::Processing || job.processed >= job.expected {
            return Err(Error::AlreadyCompleted(id));
        }

        let now = Utc::now();
        job.processed += 1;
        job.updated_at = now;
        let crossed_completion = job.processed == job.expected;
        if crossed_completion {
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
        }

        Ok(IncrementResult {
            new_processed: job.processed,
            expected: job.expected,
            crossed_completion,
        })
    }

    async fn mark_notified(&self, id: JobId) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        let job = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        if job.notified_at.is_none() {
            job.notified_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn claim_notifications(
        &self,
        completed_before: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::Other(format!("invalid claim lease: {e}")))?;
        let now = Utc::now();

        let jobs = lock(&self.jobs);
        let mut claims = lock(&self.claims);
        let mut pending: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.notified_at.is_none()
                    && j.completed_at.is_some_and(|t| t < completed_before)
                    && claims.get(&j.id).is_none_or(|until| *until <= now)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.completed_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));

        for job in &pending {
            claims.insert(job.id, now + lease);
        }
        Ok(pending)
    }

    async fn discard_job(&self, id: JobId) -> Result<bool> {
        let mut jobs = lock(&self.jobs);
        if jobs.get(&id).is_some_and(|j| j.processed == 0) {
            jobs.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let jobs = lock(&self.jobs);
        let mut matched: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(usize::try_from(filter.limit).unwrap_or(0));
        Ok(matched)
    }
}

impl ItemStore for MemoryStore {
    async fn upsert_item(&self, id: &ItemId, attributes: &Attributes) -> Result<UpsertResult> {
        let mut items = lock(&self.items);
        let now = Utc::now();
        let created = match items.get_mut(id) {
            Some(item) => {
                if merge_attributes(&mut item.attributes, attributes) {
                    item.updated_at = now;
                }
                false
            }
            None => {
                let mut stored = Attributes::new();
                merge_attributes(&mut stored, attributes);
                items.insert(
                    id.clone(),
                    Item {
                        id: id.clone(),
                        attributes: stored,
                        created_at: now,
                        updated_at: now,
                    },
                );
                true
            }
        };
        Ok(UpsertResult {
            item_id: id.clone(),
            created,
        })
    }

    async fn get_item(&self, id: &ItemId) -> Result<Option<Item>> {
        Ok(lock(&self.items).get(id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueuedMessage {
    msg_id: i64,
    read_ct: u32,
    visible_at: Instant,
    body: serde_json::Value,
}

#[derive(Debug, Default)]
struct QueueState {
    live: Vec<QueuedMessage>,
    archived: Vec<QueuedMessage>,
}

/// Visibility-timeout queue with the same delivery semantics as pgmq:
/// a read hides a message for a while, and it comes back unless archived.
#[derive(Debug)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    next_id: AtomicI64,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages not yet archived, visible or not.
    pub fn live_len(&self, queue: &str) -> usize {
        lock(&self.queues).get(queue).map_or(0, |q| q.live.len())
    }

    /// Bodies of every message ever sent to `queue`, archived or not, in
    /// send order.
    pub fn bodies(&self, queue: &str) -> Vec<serde_json::Value> {
        let queues = lock(&self.queues);
        let Some(q) = queues.get(queue) else {
            return Vec::new();
        };
        let mut all: Vec<&QueuedMessage> = q.live.iter().chain(q.archived.iter()).collect();
        all.sort_by_key(|m| m.msg_id);
        all.into_iter().map(|m| m.body.clone()).collect()
    }

    fn take_visible(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        qty: usize,
    ) -> Vec<InboundMessage> {
        let now = Instant::now();
        let mut queues = lock(&self.queues);
        let Some(q) = queues.get_mut(queue) else {
            return Vec::new();
        };
        q.live
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(qty)
            .map(|m| {
                m.read_ct += 1;
                m.visible_at = now + visibility_timeout;
                InboundMessage {
                    msg_id: m.msg_id,
                    delivery_attempt: m.read_ct,
                    body: m.body.clone(),
                }
            })
            .collect()
    }
}

impl MessageQueue for MemoryQueue {
    async fn create_queue(&self, queue: &str) -> Result<()> {
        lock(&self.queues).entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue: &str, body: &serde_json::Value) -> Result<i64> {
        let msg_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.queues)
            .entry(queue.to_string())
            .or_default()
            .live
            .push(QueuedMessage {
                msg_id,
                read_ct: 0,
                visible_at: Instant::now(),
                body: body.clone(),
            });
        Ok(msg_id)
    }

    async fn read_batch(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        qty: usize,
        max_wait: Duration,
    ) -> Result<Vec<InboundMessage>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let batch = self.take_visible(queue, visibility_timeout, qty);
            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> Result<()> {
        let mut queues = lock(&self.queues);
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| Error::Other(format!("no such queue: {queue}")))?;
        if let Some(pos) = q.live.iter().position(|m| m.msg_id == msg_id) {
            let msg = q.live.remove(pos);
            q.archived.push(msg);
        }
        Ok(())
    }
}
