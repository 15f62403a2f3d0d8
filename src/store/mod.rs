//! Storage backends for the queue engine.
//!
//! A [`Store`] owns every piece of queue state: the job log, consumer group
//! cursors, pending entries and the completion ledger. Each trait method is
//! one atomic unit. The Postgres store runs it in a single transaction, the
//! memory store inside one critical section. That is what lets the engine
//! promise single delivery, crash-safe completion and idempotent requeue
//! without any locking of its own.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::model::{
    Completion, Delivery, GroupCursor, JobId, JobRecord, JobResult, NewJob, PendingEntry,
    RequeueResult, StartPosition,
};

/// Names of the log and the consumer group a queue operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub stream: String,
    pub group: String,
}

impl QueueKeys {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
        }
    }
}

/// Wakes a suspended dispatcher when new records may be visible.
pub trait AppendListener: Send {
    /// Resolve once an append may have happened since the listener was
    /// created or last woke. Spurious wakeups are allowed. Must be cancel-safe.
    fn wait(&mut self) -> impl Future<Output = Result<()>> + Send;
}

pub trait Store: Send + Sync + 'static {
    type Listener: AppendListener;

    /// Subscribe to appends on `keys.stream`. Subscribe before checking for
    /// work so that no append between the check and the wait is missed.
    fn listen(&self, keys: &QueueKeys) -> impl Future<Output = Result<Self::Listener>> + Send;

    // -- job log ------------------------------------------------------------

    fn append(&self, keys: &QueueKeys, job: &NewJob)
    -> impl Future<Output = Result<JobRecord>> + Send;

    /// Inclusive range, retired records included. `NotFound` when empty.
    fn read_range(
        &self,
        keys: &QueueKeys,
        from: JobId,
        to: JobId,
    ) -> impl Future<Output = Result<Vec<JobRecord>>> + Send;

    fn get(&self, keys: &QueueKeys, id: JobId)
    -> impl Future<Output = Result<Option<JobRecord>>> + Send;

    /// Non-retired records strictly after `after`, in id order.
    fn read_after(
        &self,
        keys: &QueueKeys,
        after: JobId,
        max: usize,
    ) -> impl Future<Output = Result<Vec<JobRecord>>> + Send;

    // -- consumer group -----------------------------------------------------

    /// Create the group. `Error::AlreadyExists` if it is already there.
    fn create_group(
        &self,
        keys: &QueueKeys,
        start: StartPosition,
    ) -> impl Future<Output = Result<()>> + Send;

    fn group_cursor(&self, keys: &QueueKeys) -> impl Future<Output = Result<GroupCursor>> + Send;

    /// Deliver the first non-retired record after the cursor: advance the
    /// cursor and insert a pending entry with `delivery_count = 1`.
    fn claim_next(
        &self,
        keys: &QueueKeys,
        consumer: &str,
    ) -> impl Future<Output = Result<Option<Delivery>>> + Send;

    /// Move the oldest entry idle for at least `min_idle` to `consumer`,
    /// bumping its delivery count. Entries whose record is missing or
    /// retired are dropped along the way.
    fn claim_stale(
        &self,
        keys: &QueueKeys,
        consumer: &str,
        min_idle: Duration,
    ) -> impl Future<Output = Result<Option<Delivery>>> + Send;

    // -- acknowledgment -----------------------------------------------------

    /// Remove a pending entry. `Error::UnknownPendingEntry` if absent.
    fn ack(&self, keys: &QueueKeys, id: JobId) -> impl Future<Output = Result<()>> + Send;

    /// Insert a result and its index entry. Returns false if one existed.
    fn record_outcome(
        &self,
        keys: &QueueKeys,
        result: &JobResult,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Ack and record the outcome as one unit.
    fn complete(
        &self,
        keys: &QueueKeys,
        result: &JobResult,
    ) -> impl Future<Output = Result<Completion>> + Send;

    // -- recovery -----------------------------------------------------------

    /// Pending entries, oldest delivery first.
    fn pending(
        &self,
        keys: &QueueKeys,
        max: usize,
    ) -> impl Future<Output = Result<Vec<PendingEntry>>> + Send;

    /// Retire `id` and append an identical copy. On a missing source the
    /// pending entry is still cleared before `Error::SourceRecordMissing`.
    fn requeue(
        &self,
        keys: &QueueKeys,
        id: JobId,
    ) -> impl Future<Output = Result<RequeueResult>> + Send;

    // -- completion ledger --------------------------------------------------

    /// Results, most recently recorded first.
    fn completed(
        &self,
        keys: &QueueKeys,
        max: usize,
    ) -> impl Future<Output = Result<Vec<JobResult>>> + Send;

    fn result(&self, keys: &QueueKeys, id: JobId)
    -> impl Future<Output = Result<Option<JobResult>>> + Send;
}
