//! Job log operations: append, synthetic load, range reads.

use opentelemetry::KeyValue;
use tracing::debug;
use uuid::Uuid;

use super::Queue;
use crate::error::Result;
use crate::model::{JobId, JobRecord, NewJob, Payload};
use crate::store::Store;
use crate::telemetry::metrics;

impl<S: Store> Queue<S> {
    /// Append a job. Never fails on payload shape; only on store failure.
    pub async fn append(&self, job_type: impl Into<String>, payload: Payload) -> Result<JobId> {
        let record = self.submit(NewJob::new(job_type).payload(payload)).await?;
        Ok(record.id)
    }

    /// Append a job built with [`NewJob`] and return the stored record.
    pub async fn submit(&self, job: NewJob) -> Result<JobRecord> {
        let record = self.store.append(&self.keys, &job).await?;
        debug!(job_id = %record.id, job_type = %record.job_type, "job appended");
        metrics::jobs_appended().add(
            1,
            &[
                KeyValue::new("stream", self.keys.stream.clone()),
                KeyValue::new("job_type", record.job_type.clone()),
                KeyValue::new("source", "producer"),
            ],
        );
        Ok(record)
    }

    /// Append `count` synthetic `build` jobs tagged with this queue's host.
    pub async fn create_dummy_jobs(&self, count: usize) -> Result<Vec<JobId>> {
        let mut ids = Vec::new();
        for _ in 0..count {
            let commit = Uuid::new_v4().simple().to_string();
            let job = NewJob::new("build")
                .field("hostName", self.host_name.clone())
                .field("commitHash", format!("commit-{}", &commit[..7]));
            ids.push(self.submit(job).await?.id);
        }
        Ok(ids)
    }

    /// Records with ids in `from..=to`, retired ones included.
    /// `NotFound` if the range holds no retained record.
    pub async fn read_range(&self, from: JobId, to: JobId) -> Result<Vec<JobRecord>> {
        self.store.read_range(&self.keys, from, to).await
    }

    /// Point lookup. Retired records are still returned for audit.
    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.store.get(&self.keys, id).await
    }
}
