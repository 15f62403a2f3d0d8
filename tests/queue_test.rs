use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jobq::error::Error;
use jobq::model::{
    Completion, GroupInit, JobId, JobStatus, NewJob, Outcome, Payload, RequeueResult,
    StartPosition,
};
use jobq::queue::{Queue, QueueKeys};
use jobq::store::MemoryStore;
use tokio_util::sync::CancellationToken;

const LAST_ID: JobId = JobId::new(u64::MAX, u64::MAX);

/// Helper: memory-backed queue with its group reading from the beginning.
async fn test_queue() -> Queue<MemoryStore> {
    let queue = Queue::new(
        Arc::new(MemoryStore::new()),
        QueueKeys::new("jobQueueSTR", "jobQueueGRP"),
    )
    .with_host_name("host1");
    queue.ensure_group(StartPosition::Beginning).await.unwrap();
    queue
}

fn build_payload(commit: &str) -> Payload {
    Payload::from([
        ("hostName".to_string(), "host1".to_string()),
        ("commitHash".to_string(), commit.to_string()),
    ])
}

// ---------------------------------------------------------------------------
// Job log
// ---------------------------------------------------------------------------

#[tokio::test]
async fn append_assigns_increasing_ids() {
    let queue = test_queue().await;
    let mut last = JobId::ZERO;
    for i in 0..20 {
        let id = queue
            .append("build", build_payload(&format!("c{i}")))
            .await
            .unwrap();
        assert!(id > last, "{id} should be after {last}");
        last = id;
    }
}

#[tokio::test]
async fn read_range_and_get() {
    let queue = test_queue().await;
    assert!(matches!(
        queue.read_range(JobId::ZERO, LAST_ID).await,
        Err(Error::NotFound(_))
    ));

    let a = queue.append("build", build_payload("a")).await.unwrap();
    let b = queue.append("test", Payload::new()).await.unwrap();

    let records = queue.read_range(a, b).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].job_type, "build");
    assert_eq!(records[0].payload["commitHash"], "a");
    assert_eq!(records[0].enqueued_at, a.timestamp());
    assert_eq!(records[1].job_type, "test");

    assert_eq!(queue.read_range(b, b).await.unwrap().len(), 1);
    assert!(queue.get(JobId::new(1, 0)).await.unwrap().is_none());
}

#[tokio::test]
async fn dummy_jobs_carry_host_and_commit() {
    let queue = test_queue().await;
    let ids = queue.create_dummy_jobs(2).await.unwrap();
    assert_eq!(ids.len(), 2);

    let record = queue.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(record.job_type, "build");
    assert_eq!(record.payload["hostName"], "host1");
    assert!(record.payload["commitHash"].starts_with("commit-"));
    assert_eq!(record.payload["commitHash"].len(), "commit-".len() + 7);
}

// ---------------------------------------------------------------------------
// Consumer group
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ensure_group_is_idempotent() {
    let queue = test_queue().await;
    queue.append("build", Payload::new()).await.unwrap();
    queue.try_dispatch("w1").await.unwrap().unwrap();
    let cursor = queue.group_cursor().await.unwrap();

    let again = queue.ensure_group(StartPosition::Beginning).await.unwrap();
    assert_eq!(again, GroupInit::AlreadyExists);
    assert_eq!(queue.group_cursor().await.unwrap(), cursor);
}

#[tokio::test]
async fn latest_group_only_sees_future_jobs() {
    let queue = Queue::new(Arc::new(MemoryStore::new()), QueueKeys::new("s", "g"));
    let old = queue.append("build", Payload::new()).await.unwrap();
    assert_eq!(
        queue.ensure_group(StartPosition::Latest).await.unwrap(),
        GroupInit::Created
    );

    assert!(queue.list_idle(10).await.unwrap().is_empty());
    assert!(queue.try_dispatch("w1").await.unwrap().is_none());

    let new = queue.append("build", Payload::new()).await.unwrap();
    let delivery = queue.try_dispatch("w1").await.unwrap().unwrap();
    assert_eq!(delivery.record.id, new);
    assert_ne!(delivery.record.id, old);
}

#[tokio::test]
async fn appended_jobs_are_idle_until_dispatched() {
    let queue = test_queue().await;
    let a = queue.append("build", Payload::new()).await.unwrap();
    let b = queue.append("build", Payload::new()).await.unwrap();

    let idle: Vec<JobId> = queue.list_idle(10).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(idle, vec![a, b]);
    assert!(queue.list_pending(10).await.unwrap().is_empty());

    let delivery = queue.try_dispatch("w1").await.unwrap().unwrap();
    assert_eq!(delivery.record.id, a);
    assert_eq!(delivery.entry.delivery_count, 1);
    assert_eq!(delivery.entry.consumer_id, "w1");

    let idle: Vec<JobId> = queue.list_idle(10).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(idle, vec![b]);
    let pending = queue.list_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id, a);
    assert_eq!(queue.group_cursor().await.unwrap().last_delivered_id, a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatchers_receive_each_job_once() {
    let queue = test_queue().await;
    let mut appended = HashSet::new();
    for _ in 0..200 {
        appended.insert(queue.append("build", Payload::new()).await.unwrap());
    }

    let mut handles = Vec::new();
    for n in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let consumer = format!("w{n}");
            let mut got = Vec::new();
            while let Some(delivery) = queue.try_dispatch(&consumer).await.unwrap() {
                got.push(delivery.record.id);
            }
            got
        }));
    }

    let mut delivered = Vec::new();
    for handle in handles {
        delivered.extend(handle.await.unwrap());
    }
    assert_eq!(delivered.len(), 200);
    let unique: HashSet<JobId> = delivered.into_iter().collect();
    assert_eq!(unique, appended);
    assert_eq!(queue.list_pending(500).await.unwrap().len(), 200);
}

#[tokio::test]
async fn dispatch_wakes_on_append() {
    let queue = test_queue().await;
    let cancel = CancellationToken::new();

    let waiter = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.dispatch("w1", &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let id = queue.append("build", Payload::new()).await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("dispatch should wake on append")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.record.id, id);
}

#[tokio::test]
async fn cancelled_dispatch_leaves_no_trace() {
    let queue = test_queue().await;
    queue.append("build", Payload::new()).await.unwrap();
    queue.try_dispatch("w1").await.unwrap().unwrap();
    let cursor = queue.group_cursor().await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.dispatch("w2", &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("cancelled dispatch should return")
        .unwrap()
        .unwrap();
    assert!(result.is_none());
    assert_eq!(queue.group_cursor().await.unwrap(), cursor);
    assert_eq!(queue.list_pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dispatch_with_cancelled_token_returns_none() {
    let queue = test_queue().await;
    queue.append("build", Payload::new()).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(queue.dispatch("w1", &cancel).await.unwrap().is_none());
    assert_eq!(queue.list_idle(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dispatcher_delivers_in_order_across_calls() {
    let queue = test_queue().await;
    let a = queue.append("build", Payload::new()).await.unwrap();
    let b = queue.append("build", Payload::new()).await.unwrap();
    let cancel = CancellationToken::new();

    let mut dispatcher = queue.dispatcher("w1");
    assert_eq!(dispatcher.consumer(), "w1");
    assert_eq!(dispatcher.next(&cancel).await.unwrap().unwrap().record.id, a);
    assert_eq!(dispatcher.next(&cancel).await.unwrap().unwrap().record.id, b);
}

#[tokio::test]
async fn stale_reclaim_moves_entry_and_counts_delivery() {
    let queue = test_queue().await.with_reclaim_idle(Duration::ZERO);
    let id = queue.append("build", Payload::new()).await.unwrap();

    let first = queue.try_dispatch("w1").await.unwrap().unwrap();
    assert_eq!(first.record.id, id);
    assert_eq!(first.entry.delivery_count, 1);

    let second = queue.try_dispatch("w2").await.unwrap().unwrap();
    assert_eq!(second.record.id, id);
    assert_eq!(second.entry.consumer_id, "w2");
    assert_eq!(second.entry.delivery_count, 2);

    let pending = queue.list_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer_id, "w2");
}

#[tokio::test]
async fn stale_reclaim_skips_fresh_entries() {
    let queue = test_queue().await.with_reclaim_idle(Duration::from_secs(3600));
    let a = queue.append("build", Payload::new()).await.unwrap();
    let b = queue.append("build", Payload::new()).await.unwrap();

    assert_eq!(queue.try_dispatch("w1").await.unwrap().unwrap().record.id, a);
    let next = queue.try_dispatch("w2").await.unwrap().unwrap();
    assert_eq!(next.record.id, b);
    assert_eq!(next.entry.delivery_count, 1);
}

// ---------------------------------------------------------------------------
// Acknowledgment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ack_clears_pending_entry() {
    let queue = test_queue().await;
    let id = queue.append("build", Payload::new()).await.unwrap();
    queue.try_dispatch("w1").await.unwrap().unwrap();

    queue.ack(id).await.unwrap();
    assert!(queue.list_pending(10).await.unwrap().is_empty());
    assert!(matches!(
        queue.ack(id).await,
        Err(Error::UnknownPendingEntry(unknown)) if unknown == id
    ));
}

#[tokio::test]
async fn record_outcome_is_idempotent() {
    let queue = test_queue().await;
    let id = queue.append("build", Payload::new()).await.unwrap();

    let first = queue
        .record_outcome(id, "build", "host1", JobStatus::Success, "Job success")
        .await
        .unwrap();
    let second = queue
        .record_outcome(id, "build", "host1", JobStatus::Failed, "late")
        .await
        .unwrap();
    assert_eq!(first, Completion::Recorded);
    assert_eq!(second, Completion::AlreadyRecorded);

    let result = queue.result(id).await.unwrap().unwrap();
    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(result.message, "Job success");
    assert_eq!(queue.completed(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn complete_acks_and_records_once() {
    let queue = test_queue().await;
    queue.append("build", build_payload("abc")).await.unwrap();
    let delivery = queue.try_dispatch("w1").await.unwrap().unwrap();

    let outcome = Outcome::success("Job success");
    assert_eq!(
        queue.complete(&delivery.record, &outcome).await.unwrap(),
        Completion::Recorded
    );
    // A retry after a lost reply must not duplicate the result.
    assert_eq!(
        queue.complete(&delivery.record, &outcome).await.unwrap(),
        Completion::AlreadyRecorded
    );

    assert!(queue.list_pending(10).await.unwrap().is_empty());
    let results = queue.completed(10).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].job_id, delivery.record.id);
    assert_eq!(results[0].job_type, "build");
    assert_eq!(results[0].host_name, "host1");
}

#[tokio::test]
async fn complete_after_requeue_writes_nothing() {
    let queue = test_queue().await;
    queue.append("build", Payload::new()).await.unwrap();
    let delivery = queue.try_dispatch("w1").await.unwrap().unwrap();
    queue.requeue(delivery.record.id).await.unwrap();

    let err = queue
        .complete(&delivery.record, &Outcome::success("Job success"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownPendingEntry(_)));
    assert!(queue.result(delivery.record.id).await.unwrap().is_none());
    assert!(queue.completed(10).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn requeue_copies_job_and_retires_original() {
    let queue = test_queue().await;
    let original = queue.append("build", build_payload("abc")).await.unwrap();
    queue.try_dispatch("w1").await.unwrap().unwrap();

    let result = queue.requeue(original).await.unwrap();
    let RequeueResult::Requeued { original: from, new_id } = result else {
        panic!("expected Requeued, got {result:?}");
    };
    assert_eq!(from, original);
    assert!(new_id > original);

    let copy = queue.get(new_id).await.unwrap().unwrap();
    assert_eq!(copy.job_type, "build");
    assert_eq!(copy.payload, build_payload("abc"));
    assert_eq!(copy.requeued_from, Some(original));

    let retired = queue.get(original).await.unwrap().unwrap();
    assert_eq!(retired.retired_by, Some(new_id));

    assert!(queue.list_pending(10).await.unwrap().is_empty());
    let idle: Vec<JobId> = queue.list_idle(10).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(idle, vec![new_id]);

    let redelivered = queue.try_dispatch("w2").await.unwrap().unwrap();
    assert_eq!(redelivered.record.id, new_id);
    assert!(queue.try_dispatch("w3").await.unwrap().is_none());
}

#[tokio::test]
async fn double_requeue_appends_one_copy() {
    let queue = test_queue().await;
    let original = queue.append("build", Payload::new()).await.unwrap();
    queue.try_dispatch("w1").await.unwrap().unwrap();

    let first = queue.requeue(original).await.unwrap();
    let second = queue.requeue(original).await.unwrap();
    assert!(matches!(first, RequeueResult::Requeued { .. }));
    assert!(matches!(second, RequeueResult::AlreadyRequeued { .. }));
    assert_eq!(first.new_id(), second.new_id());

    assert_eq!(queue.read_range(JobId::ZERO, LAST_ID).await.unwrap().len(), 2);
}

#[tokio::test]
async fn requeue_of_undelivered_job_retires_it() {
    let queue = test_queue().await;
    let original = queue.append("build", Payload::new()).await.unwrap();

    let new_id = queue.requeue(original).await.unwrap().new_id();
    let idle: Vec<JobId> = queue.list_idle(10).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(idle, vec![new_id]);
    assert_eq!(queue.try_dispatch("w1").await.unwrap().unwrap().record.id, new_id);
}

#[tokio::test]
async fn requeue_missing_source_is_reported() {
    let queue = test_queue().await;
    let missing = JobId::new(42, 0);
    assert!(matches!(
        queue.requeue(missing).await,
        Err(Error::SourceRecordMissing(id)) if id == missing
    ));
    assert!(queue.read_range(JobId::ZERO, LAST_ID).await.is_err());
}

#[tokio::test]
async fn aborted_lists_only_entries_past_threshold() {
    let queue = test_queue().await;
    queue.append("build", Payload::new()).await.unwrap();
    queue.try_dispatch("w1").await.unwrap().unwrap();

    // Default threshold is a minute; a fresh delivery is not aborted.
    assert!(queue.list_aborted(10).await.unwrap().is_empty());

    let strict = queue.clone().with_idle_threshold(Duration::ZERO);
    assert_eq!(strict.list_aborted(10).await.unwrap().len(), 1);
    assert_eq!(strict.list_stuck(10).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Completion ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_is_newest_first_and_truncated() {
    let queue = test_queue().await;
    assert!(queue.completed(10).await.unwrap().is_empty());

    let mut order = Vec::new();
    for _ in 0..3 {
        queue.append("build", Payload::new()).await.unwrap();
        let delivery = queue.try_dispatch("w1").await.unwrap().unwrap();
        queue
            .complete(&delivery.record, &Outcome::success("Job success"))
            .await
            .unwrap();
        order.push(delivery.record.id);
    }

    let results = queue.completed(2).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].job_id, order[2]);
    assert_eq!(results[1].job_id, order[1]);
    assert!(results[0].timestamp >= results[1].timestamp);

    assert_eq!(queue.completed(10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn completion_order_follows_record_time_not_id() {
    let queue = test_queue().await;
    queue.append("build", Payload::new()).await.unwrap();
    queue.append("build", Payload::new()).await.unwrap();
    let first = queue.try_dispatch("w1").await.unwrap().unwrap();
    let second = queue.try_dispatch("w2").await.unwrap().unwrap();

    queue
        .complete(&second.record, &Outcome::success("Job success"))
        .await
        .unwrap();
    queue
        .complete(&first.record, &Outcome::failed("boom"))
        .await
        .unwrap();

    let results = queue.completed(10).await.unwrap();
    assert_eq!(results[0].job_id, first.record.id);
    assert_eq!(results[0].status, JobStatus::Failed);
    assert_eq!(results[1].job_id, second.record.id);
}

// ---------------------------------------------------------------------------
// End to end: three builds, one worker crash, manual requeue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_builds_with_crash_and_requeue() {
    let queue = test_queue().await.with_idle_threshold(Duration::ZERO);
    let ids = queue.create_dummy_jobs(3).await.unwrap();

    // One worker takes all three, finishes the first and dies on the rest.
    let d1 = queue.try_dispatch("w1").await.unwrap().unwrap();
    let d2 = queue.try_dispatch("w1").await.unwrap().unwrap();
    let d3 = queue.try_dispatch("w1").await.unwrap().unwrap();
    assert_eq!(vec![d1.record.id, d2.record.id, d3.record.id], ids);
    queue
        .complete(&d1.record, &Outcome::success("Job success"))
        .await
        .unwrap();

    let aborted: Vec<JobId> = queue.list_aborted(10).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(aborted, vec![ids[1], ids[2]]);
    assert!(queue.list_idle(10).await.unwrap().is_empty());

    let new_id = queue.requeue(ids[1]).await.unwrap().new_id();
    let d4 = queue.try_dispatch("w2").await.unwrap().unwrap();
    assert_eq!(d4.record.id, new_id);
    assert_eq!(d4.record.payload, d2.record.payload);
    queue
        .complete(&d4.record, &Outcome::success("Job success"))
        .await
        .unwrap();

    let completed: Vec<JobId> = queue.completed(10).await.unwrap().iter().map(|r| r.job_id).collect();
    assert_eq!(completed, vec![new_id, ids[0]]);

    let pending: Vec<JobId> = queue.list_pending(10).await.unwrap().iter().map(|e| e.job_id).collect();
    assert_eq!(pending, vec![ids[2]]);
    assert!(queue.list_idle(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn first_build_crashes_and_is_requeued_behind_the_rest() {
    let queue = test_queue().await.with_idle_threshold(Duration::ZERO);
    let ids = queue.create_dummy_jobs(3).await.unwrap();

    // Worker one takes the first build and dies without acknowledging it.
    let crashed = queue.try_dispatch("worker-1").await.unwrap().unwrap();
    assert_eq!(crashed.record.id, ids[0]);
    let aborted: Vec<JobId> = queue.list_aborted(10).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(aborted, vec![ids[0]]);

    let fourth = queue.requeue(ids[0]).await.unwrap().new_id();
    assert!(fourth > ids[2]);

    // Worker two drains the log: the two untouched builds, then the copy.
    let mut handled = Vec::new();
    while let Some(delivery) = queue.try_dispatch("worker-2").await.unwrap() {
        queue
            .complete(&delivery.record, &Outcome::success("Job success"))
            .await
            .unwrap();
        handled.push(delivery.record.id);
    }
    assert_eq!(handled, vec![ids[1], ids[2], fourth]);

    let completed: Vec<JobId> = queue.completed(3).await.unwrap().iter().map(|r| r.job_id).collect();
    assert_eq!(completed, vec![fourth, ids[2], ids[1]]);
    assert!(queue.list_pending(10).await.unwrap().is_empty());
    assert!(queue.list_aborted(10).await.unwrap().is_empty());
    let original = queue.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(original.retired_by, Some(fourth));
}

#[tokio::test]
async fn submit_with_builder_fields() {
    let queue = test_queue().await;
    let record = queue
        .submit(NewJob::new("deploy").field("env", "staging").field("region", "eu"))
        .await
        .unwrap();
    assert_eq!(record.job_type, "deploy");
    assert_eq!(record.payload.len(), 2);
    assert!(record.requeued_from.is_none());
    assert!(!record.is_retired());
}
