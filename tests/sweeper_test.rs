use std::sync::Arc;
use std::time::Duration;

use jobq::model::{JobId, Payload, StartPosition};
use jobq::queue::{Queue, QueueKeys};
use jobq::store::MemoryStore;
use jobq::sweeper::{Sweeper, SweeperConfig};
use tokio_util::sync::CancellationToken;

/// Helper: queue with two jobs delivered to a consumer that never acks.
async fn stuck_queue() -> (Queue<MemoryStore>, Vec<JobId>) {
    let queue = Queue::new(Arc::new(MemoryStore::new()), QueueKeys::new("s", "g"));
    queue.ensure_group(StartPosition::Beginning).await.unwrap();
    let mut ids = Vec::new();
    for _ in 0..2 {
        ids.push(queue.append("build", Payload::new()).await.unwrap());
        queue.try_dispatch("crashed").await.unwrap().unwrap();
    }
    (queue, ids)
}

fn config(auto_requeue: bool) -> SweeperConfig {
    SweeperConfig {
        interval: Duration::from_millis(10),
        idle_threshold: Duration::ZERO,
        auto_requeue,
        batch: 100,
    }
}

#[tokio::test]
async fn report_only_sweep_leaves_entries() {
    let (queue, ids) = stuck_queue().await;
    let sweeper = Sweeper::new(queue.clone(), config(false));

    let report = sweeper.sweep().await.unwrap();
    assert_eq!(report.stuck, ids);
    assert!(report.requeued.is_empty());
    assert_eq!(queue.list_pending(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn scan_respects_threshold() {
    let (queue, _) = stuck_queue().await;
    let sweeper = Sweeper::new(
        queue,
        SweeperConfig {
            idle_threshold: Duration::from_secs(3600),
            ..config(true)
        },
    );
    assert!(sweeper.scan().await.unwrap().is_empty());
    assert!(sweeper.sweep().await.unwrap().requeued.is_empty());
}

#[tokio::test]
async fn sweeper_threshold_overrides_the_queue_threshold() {
    let (queue, ids) = stuck_queue().await;
    let queue = queue.with_idle_threshold(Duration::from_secs(3600));
    assert!(queue.list_stuck(10).await.unwrap().is_empty());

    let sweeper = Sweeper::new(queue.clone(), config(false));
    let stuck: Vec<JobId> = sweeper.scan().await.unwrap().iter().map(|e| e.job_id).collect();
    assert_eq!(stuck, ids);
    // The caller's handle keeps its own threshold.
    assert!(queue.list_stuck(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn auto_requeue_sweep_replaces_stuck_jobs() {
    let (queue, ids) = stuck_queue().await;
    let sweeper = Sweeper::new(queue.clone(), config(true));

    let report = sweeper.sweep().await.unwrap();
    assert_eq!(report.requeued.len(), 2);
    assert_eq!(report.requeued[0].0, ids[0]);
    assert!(queue.list_pending(10).await.unwrap().is_empty());

    let idle: Vec<JobId> = queue.list_idle(10).await.unwrap().iter().map(|r| r.id).collect();
    let replacements: Vec<JobId> = report.requeued.iter().map(|(_, new)| *new).collect();
    assert_eq!(idle, replacements);

    // Nothing left to do on the next pass.
    assert!(sweeper.sweep().await.unwrap().stuck.is_empty());
}

#[tokio::test]
async fn run_sweeps_until_cancelled() {
    let (queue, _) = stuck_queue().await;
    let sweeper = Sweeper::new(queue.clone(), config(true));
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { sweeper.run(&cancel).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while !queue.list_pending(10).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sweeper should requeue stuck jobs");

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(queue.list_idle(10).await.unwrap().len(), 2);
}
