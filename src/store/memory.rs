//! In-process store.
//!
//! All state sits behind one tokio mutex, so every trait method is a single
//! critical section. Appends bump a watch channel that suspended dispatchers
//! subscribe to. Nothing survives the process; use [`PgStore`](super::PgStore)
//! for durability.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

use super::{AppendListener, QueueKeys, Store};
use crate::error::{Error, Result};
use crate::model::{
    Completion, Delivery, GroupCursor, JobId, JobRecord, JobResult, NewJob, PendingEntry,
    RequeueResult, StartPosition,
};

/// Memory-backed store. Cheap to create; share it through an `Arc`.
pub struct MemoryStore {
    state: Mutex<State>,
    appends: watch::Sender<u64>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
}

#[derive(Default)]
struct Stream {
    last_id: JobId,
    records: BTreeMap<JobId, JobRecord>,
    groups: HashMap<String, Group>,
    results: HashMap<JobId, JobResult>,
    /// Completion index: (recorded at, insertion seq, job).
    index: BTreeSet<(DateTime<Utc>, u64, JobId)>,
    index_seq: u64,
}

struct Group {
    cursor: JobId,
    pending: HashMap<JobId, PendingEntry>,
}

impl State {
    fn stream_mut(&mut self, name: &str) -> &mut Stream {
        self.streams.entry(name.to_string()).or_default()
    }
}

impl Stream {
    fn push(&mut self, job: &NewJob, now_ms: u64) -> JobRecord {
        let id = self.last_id.next(now_ms);
        self.last_id = id;
        let record = JobRecord::new(id, job);
        self.records.insert(id, record.clone());
        record
    }

    fn group_mut(&mut self, keys: &QueueKeys) -> Result<&mut Group> {
        self.groups
            .get_mut(&keys.group)
            .ok_or_else(|| group_missing(keys))
    }

    fn insert_result(&mut self, result: &JobResult) -> bool {
        if self.results.contains_key(&result.job_id) {
            return false;
        }
        self.index_seq += 1;
        self.index
            .insert((result.timestamp, self.index_seq, result.job_id));
        self.results.insert(result.job_id, result.clone());
        true
    }
}

fn group_missing(keys: &QueueKeys) -> Error {
    Error::NotFound(format!(
        "consumer group {} on stream {}",
        keys.group, keys.stream
    ))
}

fn now_ms(now: DateTime<Utc>) -> u64 {
    u64::try_from(now.timestamp_millis()).unwrap_or(0)
}

impl MemoryStore {
    pub fn new() -> Self {
        let (appends, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            appends,
        }
    }

    fn notify_append(&self) {
        self.appends.send_modify(|n| *n = n.wrapping_add(1));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener over the store's append counter.
pub struct MemoryListener {
    rx: watch::Receiver<u64>,
}

impl AppendListener for MemoryListener {
    async fn wait(&mut self) -> Result<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::StoreUnavailable("memory store was dropped".to_string()))
    }
}

impl Store for MemoryStore {
    type Listener = MemoryListener;

    async fn listen(&self, _keys: &QueueKeys) -> Result<MemoryListener> {
        Ok(MemoryListener {
            rx: self.appends.subscribe(),
        })
    }

    async fn append(&self, keys: &QueueKeys, job: &NewJob) -> Result<JobRecord> {
        let record = {
            let mut state = self.state.lock().await;
            state.stream_mut(&keys.stream).push(job, now_ms(Utc::now()))
        };
        self.notify_append();
        Ok(record)
    }

    async fn read_range(&self, keys: &QueueKeys, from: JobId, to: JobId) -> Result<Vec<JobRecord>> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(&keys.stream);
        let records: Vec<JobRecord> = if from <= to {
            stream.records.range(from..=to).map(|(_, r)| r.clone()).collect()
        } else {
            Vec::new()
        };
        if records.is_empty() {
            return Err(Error::NotFound(format!("records {from}..={to}")));
        }
        Ok(records)
    }

    async fn get(&self, keys: &QueueKeys, id: JobId) -> Result<Option<JobRecord>> {
        let mut state = self.state.lock().await;
        Ok(state.stream_mut(&keys.stream).records.get(&id).cloned())
    }

    async fn read_after(&self, keys: &QueueKeys, after: JobId, max: usize) -> Result<Vec<JobRecord>> {
        let mut state = self.state.lock().await;
        Ok(state
            .stream_mut(&keys.stream)
            .records
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| !r.is_retired())
            .take(max)
            .cloned()
            .collect())
    }

    async fn create_group(&self, keys: &QueueKeys, start: StartPosition) -> Result<()> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(&keys.stream);
        if stream.groups.contains_key(&keys.group) {
            return Err(Error::AlreadyExists(format!("consumer group {}", keys.group)));
        }
        let cursor = match start {
            StartPosition::Beginning => JobId::ZERO,
            StartPosition::Latest => stream.last_id,
        };
        stream.groups.insert(
            keys.group.clone(),
            Group {
                cursor,
                pending: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn group_cursor(&self, keys: &QueueKeys) -> Result<GroupCursor> {
        let mut state = self.state.lock().await;
        let group = state.stream_mut(&keys.stream).group_mut(keys)?;
        Ok(GroupCursor {
            last_delivered_id: group.cursor,
        })
    }

    async fn claim_next(&self, keys: &QueueKeys, consumer: &str) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(&keys.stream);
        let Stream {
            records, groups, ..
        } = stream;
        let group = groups.get_mut(&keys.group).ok_or_else(|| group_missing(keys))?;

        let Some(record) = records
            .range((Bound::Excluded(group.cursor), Bound::Unbounded))
            .map(|(_, r)| r)
            .find(|r| !r.is_retired())
            .cloned()
        else {
            return Ok(None);
        };

        if group.pending.contains_key(&record.id) {
            return Err(Error::InvariantViolation(format!(
                "job {} is past the cursor but already pending",
                record.id
            )));
        }

        let entry = PendingEntry {
            job_id: record.id,
            consumer_id: consumer.to_string(),
            delivered_at: Utc::now(),
            delivery_count: 1,
        };
        group.cursor = record.id;
        group.pending.insert(record.id, entry.clone());
        Ok(Some(Delivery { record, entry }))
    }

    async fn claim_stale(
        &self,
        keys: &QueueKeys,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(&keys.stream);
        let Stream {
            records, groups, ..
        } = stream;
        let group = groups.get_mut(&keys.group).ok_or_else(|| group_missing(keys))?;

        let mut candidates: Vec<(DateTime<Utc>, JobId)> = group
            .pending
            .values()
            .filter(|e| e.idle(now) >= min_idle)
            .map(|e| (e.delivered_at, e.job_id))
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            match records.get(&id) {
                Some(record) if !record.is_retired() => {
                    if let Some(entry) = group.pending.get_mut(&id) {
                        entry.consumer_id = consumer.to_string();
                        entry.delivered_at = now;
                        entry.delivery_count += 1;
                        return Ok(Some(Delivery {
                            record: record.clone(),
                            entry: entry.clone(),
                        }));
                    }
                }
                _ => {
                    group.pending.remove(&id);
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, keys: &QueueKeys, id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        let group = state.stream_mut(&keys.stream).group_mut(keys)?;
        group
            .pending
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::UnknownPendingEntry(id))
    }

    async fn record_outcome(&self, keys: &QueueKeys, result: &JobResult) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.stream_mut(&keys.stream).insert_result(result))
    }

    async fn complete(&self, keys: &QueueKeys, result: &JobResult) -> Result<Completion> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(&keys.stream);
        let had_entry = stream
            .group_mut(keys)?
            .pending
            .remove(&result.job_id)
            .is_some();

        if stream.results.contains_key(&result.job_id) {
            return Ok(Completion::AlreadyRecorded);
        }
        if !had_entry {
            return Err(Error::UnknownPendingEntry(result.job_id));
        }
        stream.insert_result(result);
        Ok(Completion::Recorded)
    }

    async fn pending(&self, keys: &QueueKeys, max: usize) -> Result<Vec<PendingEntry>> {
        let mut state = self.state.lock().await;
        let group = state.stream_mut(&keys.stream).group_mut(keys)?;
        let mut entries: Vec<PendingEntry> = group.pending.values().cloned().collect();
        entries.sort_by_key(|e| (e.delivered_at, e.job_id));
        entries.truncate(max);
        Ok(entries)
    }

    async fn requeue(&self, keys: &QueueKeys, id: JobId) -> Result<RequeueResult> {
        let result = {
            let mut state = self.state.lock().await;
            let stream = state.stream_mut(&keys.stream);
            stream.group_mut(keys)?.pending.remove(&id);

            let copy = match stream.records.get(&id) {
                None => return Err(Error::SourceRecordMissing(id)),
                Some(original) => match original.retired_by {
                    Some(new_id) => {
                        return Ok(RequeueResult::AlreadyRequeued {
                            original: id,
                            new_id,
                        });
                    }
                    None => original.requeue_copy(),
                },
            };

            let record = stream.push(&copy, now_ms(Utc::now()));
            let original = stream
                .records
                .get_mut(&id)
                .ok_or(Error::PartialRequeueFailure(id))?;
            original.retired_by = Some(record.id);
            RequeueResult::Requeued {
                original: id,
                new_id: record.id,
            }
        };
        self.notify_append();
        Ok(result)
    }

    async fn completed(&self, keys: &QueueKeys, max: usize) -> Result<Vec<JobResult>> {
        let mut state = self.state.lock().await;
        let stream = state.stream_mut(&keys.stream);
        Ok(stream
            .index
            .iter()
            .rev()
            .filter_map(|(_, _, id)| stream.results.get(id).cloned())
            .take(max)
            .collect())
    }

    async fn result(&self, keys: &QueueKeys, id: JobId) -> Result<Option<JobResult>> {
        let mut state = self.state.lock().await;
        Ok(state.stream_mut(&keys.stream).results.get(&id).cloned())
    }
}
