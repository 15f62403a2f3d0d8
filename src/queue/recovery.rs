//! Recovery: in-flight and not-yet-delivered listings, and requeue.

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use super::Queue;
use crate::error::{Error, Result};
use crate::model::{JobId, JobRecord, PendingEntry, RequeueResult};
use crate::store::Store;
use crate::telemetry::metrics;

impl<S: Store> Queue<S> {
    /// In-flight entries, oldest delivery first.
    pub async fn list_pending(&self, max: usize) -> Result<Vec<PendingEntry>> {
        self.store.pending(&self.keys, max).await
    }

    /// Records appended after the group cursor: never handed to anyone.
    pub async fn list_idle(&self, max: usize) -> Result<Vec<JobRecord>> {
        let cursor = self.group_cursor().await?;
        self.store
            .read_after(&self.keys, cursor.last_delivered_id, max)
            .await
    }

    /// Pending entries idle for at least the queue's idle threshold.
    pub async fn list_stuck(&self, max: usize) -> Result<Vec<PendingEntry>> {
        let now = Utc::now();
        let threshold = self.idle_threshold;
        Ok(self
            .list_pending(max)
            .await?
            .into_iter()
            .take_while(|entry| entry.idle(now) >= threshold)
            .collect())
    }

    /// Stuck entries resolved to their job records.
    pub async fn list_aborted(&self, max: usize) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        for entry in self.list_stuck(max).await? {
            match self.get(entry.job_id).await? {
                Some(record) => records.push(record),
                None => warn!(job_id = %entry.job_id, "pending entry without a job record"),
            }
        }
        Ok(records)
    }

    /// Retire `id` and append an identical job in its place.
    ///
    /// Idempotent: a repeated call returns the first replacement's id as
    /// `AlreadyRequeued`. If the source record is gone its pending entry is
    /// still cleared and `Error::SourceRecordMissing` is returned.
    pub async fn requeue(&self, id: JobId) -> Result<RequeueResult> {
        let result = self.store.requeue(&self.keys, id).await;
        let label = match &result {
            Ok(RequeueResult::Requeued { new_id, .. }) => {
                info!(original = %id, %new_id, "job requeued");
                metrics::jobs_appended().add(
                    1,
                    &[
                        KeyValue::new("stream", self.keys.stream.clone()),
                        KeyValue::new("source", "requeue"),
                    ],
                );
                "requeued"
            }
            Ok(RequeueResult::AlreadyRequeued { new_id, .. }) => {
                info!(original = %id, %new_id, "job was already requeued");
                "already_requeued"
            }
            Err(Error::SourceRecordMissing(_)) => {
                warn!(job_id = %id, "requeue source missing, cleared pending entry");
                "source_missing"
            }
            Err(_) => "error",
        };
        metrics::jobs_requeued().add(
            1,
            &[
                KeyValue::new("stream", self.keys.stream.clone()),
                KeyValue::new("result", label),
            ],
        );
        result
    }
}
