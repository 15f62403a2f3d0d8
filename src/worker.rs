//! Worker runtime: dispatch, handle, complete, repeat.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::handler::JobHandler;
use crate::model::{Completion, Delivery};
use crate::queue::Queue;
use crate::store::Store;
use crate::telemetry::job::{record_outcome, start_job_span};
use crate::telemetry::metrics;

/// Cap on the store retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub consumer_id: String,
    /// Consecutive store failures tolerated before the worker gives up.
    pub store_retry_attempts: u32,
    /// First retry delay; doubles on each consecutive failure.
    pub store_retry_backoff: Duration,
}

impl WorkerConfig {
    pub fn new(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            ..Self::default()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            consumer_id: format!("worker-{}", &suffix[..8]),
            store_retry_attempts: 5,
            store_retry_backoff: Duration::from_millis(200),
        }
    }
}

/// One consumer running `H` against a queue until cancelled.
pub struct Worker<S, H> {
    queue: Queue<S>,
    handler: Arc<H>,
    config: WorkerConfig,
}

impl<S, H> Clone for Worker<S, H> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
        }
    }
}

impl<S: Store, H: JobHandler> Worker<S, H> {
    pub fn new(queue: Queue<S>, handler: Arc<H>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    /// Same worker under another consumer id, for running a pool.
    pub fn with_consumer_id(&self, consumer_id: impl Into<String>) -> Self {
        let mut worker = self.clone();
        worker.config.consumer_id = consumer_id.into();
        worker
    }

    /// Run until `cancel` fires. A job already handed to the handler is
    /// finished and completed before returning. Returns the number of jobs
    /// processed; fails once store retries are exhausted.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<u64> {
        let consumer = self.config.consumer_id.as_str();
        let mut dispatcher = self.queue.dispatcher(consumer);
        let mut processed = 0u64;
        let mut failures = 0u32;

        info!(consumer, stream = %self.queue.keys().stream, "worker started");

        loop {
            let delivery = match dispatcher.next(cancel).await {
                Ok(Some(delivery)) => {
                    failures = 0;
                    delivery
                }
                Ok(None) => {
                    info!(consumer, processed, "worker stopped");
                    return Ok(processed);
                }
                Err(e) => {
                    let delay = self.next_backoff("dispatch", e, &mut failures)?;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(consumer, processed, "worker stopped during backoff");
                            return Ok(processed);
                        }
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            self.process(delivery).await?;
            processed += 1;
        }
    }

    async fn process(&self, delivery: Delivery) -> Result<()> {
        let Delivery { record, entry } = delivery;
        let span = start_job_span(&record, &entry);

        async {
            let started = Instant::now();
            let outcome = self.handler.handle(&record).await;
            metrics::job_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[
                    KeyValue::new("job_type", record.job_type.clone()),
                    KeyValue::new("status", outcome.status.to_string()),
                ],
            );
            record_outcome(&span, &outcome);

            // Completion retries ignore cancellation: the result is already paid for.
            let mut failures = 0u32;
            loop {
                match self.queue.complete(&record, &outcome).await {
                    Ok(Completion::Recorded | Completion::AlreadyRecorded) => return Ok(()),
                    Err(Error::UnknownPendingEntry(id)) => {
                        warn!(job_id = %id, "job was requeued while running, outcome dropped");
                        return Ok(());
                    }
                    Err(e) if e.is_fatal() => {
                        let delay = self.next_backoff("complete", e, &mut failures)?;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        error!(job_id = %record.id, error = %e, "could not record job outcome");
                        return Ok(());
                    }
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Delay before the next retry, or the error once attempts run out.
    fn next_backoff(&self, operation: &'static str, err: Error, failures: &mut u32) -> Result<Duration> {
        metrics::store_errors().add(1, &[KeyValue::new("operation", operation)]);
        *failures += 1;
        if *failures > self.config.store_retry_attempts {
            error!(consumer = %self.config.consumer_id, operation, error = %err, "store retries exhausted");
            return Err(err);
        }
        let delay = backoff_delay(self.config.store_retry_backoff, *failures);
        warn!(
            consumer = %self.config.consumer_id,
            operation,
            attempt = *failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "store operation failed, retrying"
        );
        Ok(delay)
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}
