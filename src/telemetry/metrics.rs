//! Metric instrument factories for chartflow.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"chartflow"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for chartflow instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("chartflow")
}

/// Counter: jobs created.
/// Labels: `result` ("ok" | "duplicate").
pub fn jobs_created() -> Counter<u64> {
    meter()
        .u64_counter("chartflow.jobs.created")
        .with_description("Number of jobs created")
        .build()
}

/// Counter: job counter increments.
/// Labels: `result` ("ok" | "completed" | "already_completed" | "not_found").
pub fn job_increments() -> Counter<u64> {
    meter()
        .u64_counter("chartflow.jobs.increments")
        .with_description("Number of job counter increments attempted")
        .build()
}

/// Counter: item upserts.
/// Labels: `result` ("created" | "merged").
pub fn item_upserts() -> Counter<u64> {
    meter()
        .u64_counter("chartflow.items.upserts")
        .with_description("Number of item upserts")
        .build()
}

/// Counter: per-message outcomes of batch processing.
/// Labels: `disposition` ("processed" | "duplicate" | "retry" | "dead_letter").
pub fn message_dispositions() -> Counter<u64> {
    meter()
        .u64_counter("chartflow.messages.dispositions")
        .with_description("Number of item messages by outcome")
        .build()
}

/// Counter: completion events handed to the notifier.
/// Labels: `result` ("ok" | "error"), `path` ("inline" | "republish").
pub fn completions_fired() -> Counter<u64> {
    meter()
        .u64_counter("chartflow.completions.fired")
        .with_description("Number of job completion events fired")
        .build()
}

/// Counter: messages whose ack or dead-letter send failed after processing.
/// Labels: `disposition` ("processed" | "duplicate" | "dead_letter").
pub fn settle_failures() -> Counter<u64> {
    meter()
        .u64_counter("chartflow.messages.settle_failures")
        .with_description("Number of item messages left unsettled after processing")
        .build()
}

/// Counter: queue-level operations (create, send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("chartflow.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: batch processing duration in milliseconds.
/// Labels: `worker`.
pub fn batch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("chartflow.batch.duration_ms")
        .with_description("Batch processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
