//! Metric instrument factories for jobq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobq")
}

/// Counter: records appended to the job log.
/// Labels: `stream`, `job_type`, `source` ("producer" | "requeue").
pub fn jobs_appended() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.appended")
        .with_description("Number of job records appended")
        .build()
}

/// Counter: deliveries handed to consumers.
/// Labels: `stream`, `kind` ("new" | "reclaimed").
pub fn jobs_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.dispatched")
        .with_description("Number of job deliveries")
        .build()
}

/// Counter: jobs completed.
/// Labels: `stream`, `status`, `result` ("recorded" | "already_recorded").
pub fn jobs_completed() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.completed")
        .with_description("Number of job completions")
        .build()
}

/// Counter: requeue operations.
/// Labels: `stream`, `result` ("requeued" | "already_requeued" | "source_missing").
pub fn jobs_requeued() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.requeued")
        .with_description("Number of requeue operations")
        .build()
}

/// Counter: store-level failures surfaced to callers.
/// Labels: `operation`.
pub fn store_errors() -> Counter<u64> {
    meter()
        .u64_counter("jobq.store.errors")
        .with_description("Number of store operations that failed")
        .build()
}

/// Histogram: handler run time in milliseconds.
/// Labels: `job_type`, `status`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.job.duration_ms")
        .with_description("Job handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
