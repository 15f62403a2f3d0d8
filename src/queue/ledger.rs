//! Completion ledger queries.

use super::Queue;
use crate::error::Result;
use crate::model::{JobId, JobResult};
use crate::store::Store;

impl<S: Store> Queue<S> {
    /// Up to `max` results, most recently recorded first. Never an error
    /// for an empty or short ledger.
    pub async fn completed(&self, max: usize) -> Result<Vec<JobResult>> {
        self.store.completed(&self.keys, max).await
    }

    pub async fn result(&self, id: JobId) -> Result<Option<JobResult>> {
        self.store.result(&self.keys, id).await
    }
}
