//! Span helpers for batch and message processing.

use tracing::Span;

/// Start a span covering one batch read by a worker.
pub fn start_batch_span(worker: &str, size: usize) -> Span {
    tracing::info_span!(
        "batch.process",
        "batch.worker" = worker,
        "batch.size" = size,
    )
}

/// Start a span for one message within a batch.
///
/// The `message.job_id` and `message.disposition` fields are declared
/// empty and filled in as processing learns them.
pub fn start_message_span(msg_id: i64, delivery_attempt: u32) -> Span {
    tracing::info_span!(
        "message.process",
        "message.id" = msg_id,
        "message.attempt" = delivery_attempt,
        "message.job_id" = tracing::field::Empty,
        "message.disposition" = tracing::field::Empty,
    )
}

/// Record the outcome of a message on its span.
pub fn record_disposition(span: &Span, disposition: &str) {
    span.record("message.disposition", disposition);
    span.in_scope(|| {
        tracing::debug!(disposition, "message_disposition");
    });
}
