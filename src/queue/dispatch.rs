//! Consumer group setup and delivery.
//!
//! Delivery never spins: when nothing is deliverable the dispatcher parks
//! on the store's append listener until an append (or, with reclaim
//! enabled, the reclaim interval) wakes it, or the caller cancels.
//! The claim itself always runs to completion outside the cancellable wait,
//! so cancelling can never leave a half-registered pending entry.

use opentelemetry::KeyValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Queue;
use crate::error::{Error, Result};
use crate::model::{Delivery, GroupCursor, GroupInit, StartPosition};
use crate::store::{AppendListener, Store};
use crate::telemetry::metrics;

/// Floor for the reclaim re-check so a zero threshold cannot busy-loop.
const MIN_RECLAIM_RECHECK: Duration = Duration::from_millis(100);

impl<S: Store> Queue<S> {
    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&self, start: StartPosition) -> Result<GroupInit> {
        match self.store.create_group(&self.keys, start).await {
            Ok(()) => {
                info!(stream = %self.keys.stream, group = %self.keys.group, ?start, "consumer group created");
                Ok(GroupInit::Created)
            }
            Err(Error::AlreadyExists(what)) => {
                debug!(%what, "consumer group already exists");
                Ok(GroupInit::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn group_cursor(&self) -> Result<GroupCursor> {
        self.store.group_cursor(&self.keys).await
    }

    /// Deliver one job to `consumer` if any is available, without waiting.
    pub async fn try_dispatch(&self, consumer: &str) -> Result<Option<Delivery>> {
        if let Some(min_idle) = self.reclaim_idle {
            if let Some(delivery) = self.store.claim_stale(&self.keys, consumer, min_idle).await? {
                info!(
                    job_id = %delivery.record.id,
                    consumer,
                    delivery_count = delivery.entry.delivery_count,
                    "reclaimed stale job"
                );
                self.count_dispatch("reclaimed");
                return Ok(Some(delivery));
            }
        }

        let delivery = self.store.claim_next(&self.keys, consumer).await?;
        if let Some(ref d) = delivery {
            debug!(job_id = %d.record.id, consumer, "job dispatched");
            self.count_dispatch("new");
        }
        Ok(delivery)
    }

    /// Deliver the next job to `consumer`, suspending until one is available.
    /// Returns `None` once `cancel` fires.
    pub async fn dispatch(
        &self,
        consumer: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>> {
        self.dispatcher(consumer).next(cancel).await
    }

    /// A reusable dispatcher that keeps its append listener between calls.
    pub fn dispatcher(&self, consumer: impl Into<String>) -> Dispatcher<S> {
        Dispatcher {
            queue: self.clone(),
            consumer: consumer.into(),
            listener: None,
        }
    }

    fn count_dispatch(&self, kind: &'static str) {
        metrics::jobs_dispatched().add(
            1,
            &[
                KeyValue::new("stream", self.keys.stream.clone()),
                KeyValue::new("kind", kind),
            ],
        );
    }
}

/// Per-consumer delivery loop state.
pub struct Dispatcher<S: Store> {
    queue: Queue<S>,
    consumer: String,
    listener: Option<S::Listener>,
}

impl<S: Store> Dispatcher<S> {
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Next delivery for this consumer, or `None` once `cancel` fires.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Delivery>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        // Subscribe before the first claim attempt so no append is missed.
        let mut listener = match self.listener.take() {
            Some(listener) => listener,
            None => self.queue.store.listen(&self.queue.keys).await?,
        };
        let result = wait_for_job(&self.queue, &self.consumer, &mut listener, cancel).await;
        if result.is_ok() {
            self.listener = Some(listener);
        }
        result
    }
}

/// Borrows the queue and consumer separately so the future only needs the
/// listener to be `Send`, not `Sync`.
async fn wait_for_job<S: Store>(
    queue: &Queue<S>,
    consumer: &str,
    listener: &mut S::Listener,
    cancel: &CancellationToken,
) -> Result<Option<Delivery>> {
    let recheck = queue.reclaim_idle.map(|idle| idle.max(MIN_RECLAIM_RECHECK));

    loop {
        if let Some(delivery) = queue.try_dispatch(consumer).await? {
            return Ok(Some(delivery));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(consumer, "dispatch cancelled");
                return Ok(None);
            }
            woke = listener.wait() => woke?,
            _ = sleep_or_forever(recheck) => {}
        }
    }
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
