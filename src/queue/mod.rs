//! Queue engine: the public API for producers, workers and operators.
//!
//! A [`Queue`] is an explicitly constructed handle over one store, one job
//! log (stream) and one consumer group. It is cheap to clone and every clone
//! talks to the same store. Operations are grouped by concern:
//!
//! - `log`: append and read job records
//! - `dispatch`: consumer group setup and delivery
//! - `ack`: acknowledgment and outcome recording
//! - `recovery`: pending/idle listings and requeue
//! - `ledger`: completion history

mod ack;
mod dispatch;
mod ledger;
mod log;
mod recovery;

use std::sync::Arc;
use std::time::Duration;

pub use crate::store::QueueKeys;
pub use dispatch::Dispatcher;

/// Host tag used when none is configured.
pub const DEFAULT_HOST_NAME: &str = "localhost";

/// Handle to a job queue backed by `S`.
pub struct Queue<S> {
    store: Arc<S>,
    keys: QueueKeys,
    host_name: String,
    idle_threshold: Duration,
    reclaim_idle: Option<Duration>,
}

impl<S> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            host_name: self.host_name.clone(),
            idle_threshold: self.idle_threshold,
            reclaim_idle: self.reclaim_idle,
        }
    }
}

impl<S> Queue<S> {
    pub fn new(store: Arc<S>, keys: QueueKeys) -> Self {
        Self {
            store,
            keys,
            host_name: DEFAULT_HOST_NAME.to_string(),
            idle_threshold: Duration::from_secs(60),
            reclaim_idle: None,
        }
    }

    /// Host tag written into generated payloads and job results.
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// How long a pending entry must sit idle before it counts as aborted.
    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    /// Let dispatch take over entries idle for at least `min_idle` before
    /// handing out new records.
    pub fn with_reclaim_idle(mut self, min_idle: Duration) -> Self {
        self.reclaim_idle = Some(min_idle);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }
}
