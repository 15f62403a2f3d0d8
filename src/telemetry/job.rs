//! Job execution span helpers.

use tracing::Span;

use crate::model::{JobRecord, Outcome, PendingEntry};

/// Span covering one delivery of a job to a handler. `job.status` is filled
/// in by [`record_outcome`].
pub fn start_job_span(record: &JobRecord, entry: &PendingEntry) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %record.id,
        "job.type" = %record.job_type,
        "job.consumer" = %entry.consumer_id,
        "job.delivery_count" = entry.delivery_count,
        "job.status" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &Outcome) {
    span.record("job.status", tracing::field::display(outcome.status));
    span.in_scope(|| {
        tracing::info!(status = %outcome.status, message = %outcome.message, "job finished");
    });
}
