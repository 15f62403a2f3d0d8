//! Periodic recovery of stuck jobs.
//!
//! The sweeper finds pending entries idle past a threshold. With
//! `auto_requeue` it requeues them; otherwise it only reports them.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{JobId, PendingEntry};
use crate::queue::Queue;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub idle_threshold: Duration,
    pub auto_requeue: bool,
    /// Pending entries inspected per pass.
    pub batch: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(60),
            auto_requeue: false,
            batch: 100,
        }
    }
}

/// What one sweep pass saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stuck: Vec<JobId>,
    /// `(original, replacement)` pairs.
    pub requeued: Vec<(JobId, JobId)>,
    /// Stuck entries whose record was already gone.
    pub missing: Vec<JobId>,
}

pub struct Sweeper<S> {
    queue: Queue<S>,
    config: SweeperConfig,
}

impl<S: Store> Sweeper<S> {
    /// The sweeper's idle threshold overrides the one on `queue`.
    pub fn new(queue: Queue<S>, config: SweeperConfig) -> Self {
        let queue = queue.with_idle_threshold(config.idle_threshold);
        Self { queue, config }
    }

    /// Pending entries idle for at least the threshold, oldest first.
    pub async fn scan(&self) -> Result<Vec<PendingEntry>> {
        self.queue.list_stuck(self.config.batch).await
    }

    /// One pass: scan, and requeue what was found if configured to.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let stuck = self.scan().await?;
        let mut report = SweepReport {
            stuck: stuck.iter().map(|e| e.job_id).collect(),
            ..SweepReport::default()
        };
        if !self.config.auto_requeue {
            for entry in &stuck {
                warn!(
                    job_id = %entry.job_id,
                    consumer = %entry.consumer_id,
                    delivery_count = entry.delivery_count,
                    "job stuck in flight"
                );
            }
            return Ok(report);
        }

        for entry in stuck {
            match self.queue.requeue(entry.job_id).await {
                Ok(result) => report.requeued.push((entry.job_id, result.new_id())),
                Err(Error::SourceRecordMissing(id)) => report.missing.push(id),
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Sweep every interval until cancelled. Store failures end the loop.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            idle_threshold_secs = self.config.idle_threshold.as_secs(),
            auto_requeue = self.config.auto_requeue,
            "sweeper started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("sweeper stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            let report = self.sweep().await?;
            if !report.stuck.is_empty() {
                info!(
                    stuck = report.stuck.len(),
                    requeued = report.requeued.len(),
                    missing = report.missing.len(),
                    "sweep finished"
                );
            }
        }
    }
}
