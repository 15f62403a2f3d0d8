//! Core data model.
//!
//! A job record is an immutable entry in the job log. Delivery bookkeeping
//! (pending entries, the group cursor) and terminal outcomes (job results)
//! live beside it and refer back to it by [`JobId`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Job Id
// ---------------------------------------------------------------------------

/// Log-assigned job identifier: `<millis>-<seq>`.
///
/// Ordering is lexicographic on `(ms, seq)`, which is also append order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId {
    pub ms: u64,
    pub seq: u64,
}

impl JobId {
    /// The position before every record. A cursor here has delivered nothing.
    pub const ZERO: JobId = JobId { ms: 0, seq: 0 };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The id that follows `self` when appending at wall-clock `now_ms`.
    ///
    /// If the clock has not moved past the last id (or went backwards) the
    /// millisecond part is kept and the sequence bumped, so ids never repeat.
    pub fn next(self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self { ms: now_ms, seq: 0 }
        } else {
            Self {
                ms: self.ms,
                seq: self.seq + 1,
            }
        }
    }

    /// Append time encoded in the id.
    pub fn timestamp(&self) -> DateTime<Utc> {
        i64::try_from(self.ms)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidJobId(s.to_string()))?;
        let ms = ms
            .parse()
            .map_err(|_| Error::InvalidJobId(s.to_string()))?;
        let seq = seq
            .parse()
            .map_err(|_| Error::InvalidJobId(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Job Record
// ---------------------------------------------------------------------------

/// Opaque key/value job parameters (e.g. `hostName`, `commitHash`).
pub type Payload = BTreeMap<String, String>;

/// Decode a stored payload, which must be a flat object of string values.
pub fn decode_payload(value: serde_json::Value) -> Result<Payload> {
    let serde_json::Value::Object(map) = value else {
        return Err(Error::malformed("payload", "expected a JSON object"));
    };
    map.into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => Ok((key, s)),
            other => Err(Error::malformed(
                format!("payload.{key}"),
                format!("expected a string, got {other}"),
            )),
        })
        .collect()
}

/// Decode a stored textual id column.
pub(crate) fn decode_job_id(field: &str, raw: &str) -> Result<JobId> {
    raw.parse()
        .map_err(|_| Error::malformed(field, format!("not a job id: {raw:?}")))
}

/// An entry in the job log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    pub payload: Payload,
    /// Derived from `id`.
    pub enqueued_at: DateTime<Utc>,
    /// Set on records created by a requeue: the record this one replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_from: Option<JobId>,
    /// Set once this record has been superseded by a requeue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_by: Option<JobId>,
}

impl JobRecord {
    pub fn new(id: JobId, job: &NewJob) -> Self {
        Self {
            id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            enqueued_at: id.timestamp(),
            requeued_from: job.requeued_from,
            retired_by: None,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired_by.is_some()
    }

    /// A fresh job carrying identical type and payload, pointing back here.
    pub(crate) fn requeue_copy(&self) -> NewJob {
        NewJob {
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            requeued_from: Some(self.id),
        }
    }
}

/// Builder for jobs to append. The producer-facing half of the log API.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) job_type: String,
    pub(crate) payload: Payload,
    pub(crate) requeued_from: Option<JobId>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: Payload::new(),
            requeued_from: None,
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }
}

// ---------------------------------------------------------------------------
// Delivery bookkeeping
// ---------------------------------------------------------------------------

/// A delivered-but-unacknowledged job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub job_id: JobId,
    pub consumer_id: String,
    pub delivered_at: DateTime<Utc>,
    pub delivery_count: u32,
}

impl PendingEntry {
    /// Time since the last delivery, zero if `delivered_at` is in the future.
    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        (now - self.delivered_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Per-group delivery position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCursor {
    pub last_delivered_id: JobId,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Every record already in the log is deliverable.
    Beginning,
    /// Only records appended after group creation are deliverable.
    Latest,
}

impl FromStr for StartPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "beginning" | "0" => Ok(Self::Beginning),
            "latest" | "$" => Ok(Self::Latest),
            other => Err(Error::Config(format!(
                "unknown group start position {other:?} (expected `beginning` or `latest`)"
            ))),
        }
    }
}

/// Result of [`Queue::ensure_group`](crate::queue::Queue::ensure_group).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupInit {
    Created,
    AlreadyExists,
}

/// A record handed to a consumer together with its pending entry.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub record: JobRecord,
    pub entry: PendingEntry,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What a handler reports after running a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: JobStatus,
    pub message: String,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Success,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            message: message.into(),
        }
    }
}

/// Terminal outcome of a job, written once at acknowledgment time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(rename = "id")]
    pub job_id: JobId,
    pub job_type: String,
    pub host_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: JobStatus,
    pub message: String,
}

/// Result of completing a job (ack + outcome as one unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Pending entry cleared and outcome written.
    Recorded,
    /// An outcome already existed; any leftover pending entry was cleared.
    AlreadyRecorded,
}

/// Result of requeueing a stuck job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueResult {
    /// The original was retired and a copy appended.
    Requeued { original: JobId, new_id: JobId },
    /// A previous requeue already did the work; nothing new was appended.
    AlreadyRequeued { original: JobId, new_id: JobId },
}

impl RequeueResult {
    pub fn new_id(&self) -> JobId {
        match self {
            RequeueResult::Requeued { new_id, .. } | RequeueResult::AlreadyRequeued { new_id, .. } => {
                *new_id
            }
        }
    }
}
