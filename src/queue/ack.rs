//! Acknowledgment and outcome recording.

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, info};

use super::Queue;
use crate::error::Result;
use crate::model::{Completion, JobId, JobRecord, JobResult, JobStatus, Outcome};
use crate::store::Store;
use crate::telemetry::metrics;

impl<S: Store> Queue<S> {
    /// Clear the pending entry for `id`.
    ///
    /// `Error::UnknownPendingEntry` means the job was already acknowledged
    /// or requeued under a new id; callers log it and move on.
    pub async fn ack(&self, id: JobId) -> Result<()> {
        self.store.ack(&self.keys, id).await?;
        debug!(job_id = %id, "job acknowledged");
        Ok(())
    }

    /// Write the terminal result for a job. Safe to retry: a second call
    /// for the same id leaves the first result in place.
    pub async fn record_outcome(
        &self,
        id: JobId,
        job_type: &str,
        host_name: &str,
        status: JobStatus,
        message: &str,
    ) -> Result<Completion> {
        let result = JobResult {
            job_id: id,
            job_type: job_type.to_string(),
            host_name: host_name.to_string(),
            timestamp: Utc::now(),
            status,
            message: message.to_string(),
        };
        let written = self.store.record_outcome(&self.keys, &result).await?;
        Ok(if written {
            Completion::Recorded
        } else {
            Completion::AlreadyRecorded
        })
    }

    /// Acknowledge `record` and record its outcome as one atomic step.
    ///
    /// Retrying after a lost reply returns `AlreadyRecorded`. If the job was
    /// requeued while it ran, nothing is written and
    /// `Error::UnknownPendingEntry` is returned; the replacement reports.
    pub async fn complete(&self, record: &JobRecord, outcome: &Outcome) -> Result<Completion> {
        let result = JobResult {
            job_id: record.id,
            job_type: record.job_type.clone(),
            host_name: self.host_name.clone(),
            timestamp: Utc::now(),
            status: outcome.status,
            message: outcome.message.clone(),
        };
        let completion = self.store.complete(&self.keys, &result).await?;

        match completion {
            Completion::Recorded => {
                info!(job_id = %record.id, status = %outcome.status, "job completed")
            }
            Completion::AlreadyRecorded => {
                info!(job_id = %record.id, "job outcome was already recorded")
            }
        }
        metrics::jobs_completed().add(
            1,
            &[
                KeyValue::new("stream", self.keys.stream.clone()),
                KeyValue::new("status", outcome.status.to_string()),
                KeyValue::new(
                    "result",
                    match completion {
                        Completion::Recorded => "recorded",
                        Completion::AlreadyRecorded => "already_recorded",
                    },
                ),
            ],
        );
        Ok(completion)
    }
}
