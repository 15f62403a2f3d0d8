//! Postgres store via direct SQLx.
//!
//! Every trait method runs in one transaction. Row locks are taken in the
//! order `job_streams` → `consumer_groups` → `job_log` → `pending_entries`;
//! an operation may skip a table but never goes back to an earlier one.
//! Appends publish on the `jobq_append` channel; the NOTIFY only fires on
//! commit, so a woken dispatcher always sees the new row.

use chrono::Utc;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use tracing::{debug, warn};

use super::{AppendListener, QueueKeys, Store};
use crate::error::{Error, Result};
use crate::model::{
    Completion, Delivery, GroupCursor, JobId, JobRecord, JobResult, NewJob, PendingEntry,
    RequeueResult, StartPosition, decode_job_id, decode_payload,
};

/// NOTIFY channel for appends; the payload is the stream name.
pub const APPEND_CHANNEL: &str = "jobq_append";

const JOB_COLUMNS: &str = "id_ms, id_seq, job_type, payload, requeued_from, retired_by";

/// Database handle. Owns the connection pool shared by all queue handles.
pub struct PgStore {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Fallback wake-up for listeners in case a NOTIFY is lost on reconnect.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// Column form of an id. Ids past `i64::MAX` can never have been stored, so
/// they are rejected as invalid input.
fn id_cols(id: JobId) -> Result<(i64, i64)> {
    match (i64::try_from(id.ms), i64::try_from(id.seq)) {
        (Ok(ms), Ok(seq)) => Ok((ms, seq)),
        _ => Err(Error::InvalidJobId(id.to_string())),
    }
}

/// Range bound form of [`id_cols`]: ids beyond the column range cannot be
/// stored, so clamping keeps the query's meaning.
fn bound_cols(id: JobId) -> (i64, i64) {
    let ms = i64::try_from(id.ms).unwrap_or(i64::MAX);
    let seq = if ms == i64::MAX && id.ms > i64::MAX as u64 {
        i64::MAX
    } else {
        i64::try_from(id.seq).unwrap_or(i64::MAX)
    };
    (ms, seq)
}

fn decode_id(field: &str, ms: i64, seq: i64) -> Result<JobId> {
    let ms = u64::try_from(ms).map_err(|_| Error::malformed(field, "negative millis"))?;
    let seq = u64::try_from(seq).map_err(|_| Error::malformed(field, "negative sequence"))?;
    Ok(JobId::new(ms, seq))
}

fn limit(max: usize) -> i64 {
    i64::try_from(max).unwrap_or(i64::MAX)
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id_ms: i64,
    id_seq: i64,
    job_type: String,
    payload: serde_json::Value,
    requeued_from: Option<String>,
    retired_by: Option<String>,
}

impl JobRow {
    fn try_into_record(self) -> Result<JobRecord> {
        let id = decode_id("id", self.id_ms, self.id_seq)?;
        Ok(JobRecord {
            id,
            job_type: self.job_type,
            payload: decode_payload(self.payload)?,
            enqueued_at: id.timestamp(),
            requeued_from: self
                .requeued_from
                .map(|raw| decode_job_id("requeued_from", &raw))
                .transpose()?,
            retired_by: self
                .retired_by
                .map(|raw| decode_job_id("retired_by", &raw))
                .transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    id_ms: i64,
    id_seq: i64,
    consumer: String,
    delivered_at: chrono::DateTime<Utc>,
    delivery_count: i32,
}

impl PendingRow {
    fn try_into_entry(self) -> Result<PendingEntry> {
        Ok(PendingEntry {
            job_id: decode_id("id", self.id_ms, self.id_seq)?,
            consumer_id: self.consumer,
            delivered_at: self.delivered_at,
            delivery_count: u32::try_from(self.delivery_count)
                .map_err(|_| Error::malformed("delivery_count", "negative"))?,
        })
    }
}

fn decode_result(detail: serde_json::Value) -> Result<JobResult> {
    serde_json::from_value(detail).map_err(|e| Error::malformed("detail", e.to_string()))
}

// ---------------------------------------------------------------------------
// Transaction steps
// ---------------------------------------------------------------------------

async fn lock_stream(conn: &mut PgConnection, stream: &str) -> Result<JobId> {
    sqlx::query("INSERT INTO job_streams (name) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(stream)
        .execute(&mut *conn)
        .await?;
    let (ms, seq): (i64, i64) =
        sqlx::query_as("SELECT last_ms, last_seq FROM job_streams WHERE name = $1 FOR UPDATE")
            .bind(stream)
            .fetch_one(&mut *conn)
            .await?;
    decode_id("job_streams.last", ms, seq)
}

async fn append_on(conn: &mut PgConnection, stream: &str, job: &NewJob) -> Result<JobRecord> {
    let last = lock_stream(conn, stream).await?;
    let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    let id = last.next(now_ms);
    let (ms, seq) = id_cols(id)?;

    sqlx::query("UPDATE job_streams SET last_ms = $2, last_seq = $3 WHERE name = $1")
        .bind(stream)
        .bind(ms)
        .bind(seq)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "INSERT INTO job_log (stream, id_ms, id_seq, job_type, payload, requeued_from)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(stream)
    .bind(ms)
    .bind(seq)
    .bind(&job.job_type)
    .bind(Json(&job.payload))
    .bind(job.requeued_from.map(|id| id.to_string()))
    .execute(&mut *conn)
    .await?;

    // NOTIFY is transactional, only fires on commit
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(APPEND_CHANNEL)
        .bind(stream)
        .execute(&mut *conn)
        .await?;

    Ok(JobRecord::new(id, job))
}

async fn fetch_record(
    conn: &mut PgConnection,
    stream: &str,
    id: JobId,
    for_update: bool,
) -> Result<Option<JobRecord>> {
    let (ms, seq) = id_cols(id)?;
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM job_log WHERE stream = $1 AND id_ms = $2 AND id_seq = $3{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(stream)
        .bind(ms)
        .bind(seq)
        .fetch_optional(&mut *conn)
        .await?
        .map(JobRow::try_into_record)
        .transpose()
}

async fn require_group(conn: &mut PgConnection, keys: &QueueKeys, lock: bool) -> Result<JobId> {
    let sql = format!(
        "SELECT last_ms, last_seq FROM consumer_groups WHERE stream = $1 AND name = $2{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row: Option<(i64, i64)> = sqlx::query_as(&sql)
        .bind(&keys.stream)
        .bind(&keys.group)
        .fetch_optional(&mut *conn)
        .await?;
    let (ms, seq) = row.ok_or_else(|| {
        Error::NotFound(format!(
            "consumer group {} on stream {}",
            keys.group, keys.stream
        ))
    })?;
    decode_id("consumer_groups.last", ms, seq)
}

async fn delete_pending(conn: &mut PgConnection, keys: &QueueKeys, id: JobId) -> Result<bool> {
    let (ms, seq) = id_cols(id)?;
    let deleted = sqlx::query(
        "DELETE FROM pending_entries WHERE stream = $1 AND grp = $2 AND id_ms = $3 AND id_seq = $4",
    )
    .bind(&keys.stream)
    .bind(&keys.group)
    .bind(ms)
    .bind(seq)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(deleted > 0)
}

async fn insert_result(conn: &mut PgConnection, stream: &str, result: &JobResult) -> Result<bool> {
    let (ms, seq) = id_cols(result.job_id)?;
    let inserted = sqlx::query(
        "INSERT INTO job_results (stream, id_ms, id_seq, recorded_at, detail)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT DO NOTHING",
    )
    .bind(stream)
    .bind(ms)
    .bind(seq)
    .bind(result.timestamp)
    .bind(Json(result))
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// LISTEN on [`APPEND_CHANNEL`] with a poll fallback.
pub struct PgAppendListener {
    listener: PgListener,
    stream: String,
    poll_interval: Duration,
}

impl AppendListener for PgAppendListener {
    async fn wait(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                notif = self.listener.recv() => match notif {
                    Ok(n) if n.payload() == self.stream => return Ok(()),
                    Ok(n) => debug!(stream = n.payload(), "append on another stream"),
                    Err(e) => {
                        warn!("PgListener error: {e}, falling back to poll");
                        tokio::time::sleep(self.poll_interval).await;
                        return Ok(());
                    }
                },
                _ = tokio::time::sleep(self.poll_interval) => return Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl Store for PgStore {
    type Listener = PgAppendListener;

    async fn listen(&self, keys: &QueueKeys) -> Result<PgAppendListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(APPEND_CHANNEL).await?;
        Ok(PgAppendListener {
            listener,
            stream: keys.stream.clone(),
            poll_interval: self.poll_interval,
        })
    }

    async fn append(&self, keys: &QueueKeys, job: &NewJob) -> Result<JobRecord> {
        let mut tx = self.pool.begin().await?;
        let record = append_on(&mut tx, &keys.stream, job).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn read_range(&self, keys: &QueueKeys, from: JobId, to: JobId) -> Result<Vec<JobRecord>> {
        let (from_ms, from_seq) = bound_cols(from);
        let (to_ms, to_seq) = bound_cols(to);
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM job_log
             WHERE stream = $1 AND (id_ms, id_seq) >= ($2, $3) AND (id_ms, id_seq) <= ($4, $5)
             ORDER BY id_ms, id_seq"
        ))
        .bind(&keys.stream)
        .bind(from_ms)
        .bind(from_seq)
        .bind(to_ms)
        .bind(to_seq)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(Error::NotFound(format!("records {from}..={to}")));
        }
        rows.into_iter().map(JobRow::try_into_record).collect()
    }

    async fn get(&self, keys: &QueueKeys, id: JobId) -> Result<Option<JobRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_record(&mut conn, &keys.stream, id, false).await
    }

    async fn read_after(&self, keys: &QueueKeys, after: JobId, max: usize) -> Result<Vec<JobRecord>> {
        let (ms, seq) = bound_cols(after);
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM job_log
             WHERE stream = $1 AND (id_ms, id_seq) > ($2, $3) AND retired_by IS NULL
             ORDER BY id_ms, id_seq
             LIMIT $4"
        ))
        .bind(&keys.stream)
        .bind(ms)
        .bind(seq)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(JobRow::try_into_record)
        .collect()
    }

    async fn create_group(&self, keys: &QueueKeys, start: StartPosition) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let last = lock_stream(&mut tx, &keys.stream).await?;
        let cursor = match start {
            StartPosition::Beginning => JobId::ZERO,
            StartPosition::Latest => last,
        };
        let (ms, seq) = id_cols(cursor)?;

        let created = sqlx::query(
            "INSERT INTO consumer_groups (stream, name, last_ms, last_seq)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT DO NOTHING",
        )
        .bind(&keys.stream)
        .bind(&keys.group)
        .bind(ms)
        .bind(seq)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if created == 0 {
            return Err(Error::AlreadyExists(format!("consumer group {}", keys.group)));
        }
        Ok(())
    }

    async fn group_cursor(&self, keys: &QueueKeys) -> Result<GroupCursor> {
        let mut conn = self.pool.acquire().await?;
        let last = require_group(&mut conn, keys, false).await?;
        Ok(GroupCursor {
            last_delivered_id: last,
        })
    }

    async fn claim_next(&self, keys: &QueueKeys, consumer: &str) -> Result<Option<Delivery>> {
        let mut tx = self.pool.begin().await?;
        // The group row lock serializes dispatchers of this group. The job_log
        // row lock makes a concurrent requeue of the same record wait, so
        // the original and its copy are never both handed out.
        let cursor = require_group(&mut tx, keys, true).await?;
        let (cursor_ms, cursor_seq) = id_cols(cursor)?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM job_log
             WHERE stream = $1 AND (id_ms, id_seq) > ($2, $3) AND retired_by IS NULL
             ORDER BY id_ms, id_seq
             LIMIT 1
             FOR UPDATE"
        ))
        .bind(&keys.stream)
        .bind(cursor_ms)
        .bind(cursor_seq)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let record = row.try_into_record()?;
        let (ms, seq) = id_cols(record.id)?;
        let delivered_at = Utc::now();

        sqlx::query(
            "UPDATE consumer_groups SET last_ms = $3, last_seq = $4 WHERE stream = $1 AND name = $2",
        )
        .bind(&keys.stream)
        .bind(&keys.group)
        .bind(ms)
        .bind(seq)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            "INSERT INTO pending_entries (stream, grp, id_ms, id_seq, consumer, delivered_at, delivery_count)
             VALUES ($1, $2, $3, $4, $5, $6, 1)
             ON CONFLICT DO NOTHING",
        )
        .bind(&keys.stream)
        .bind(&keys.group)
        .bind(ms)
        .bind(seq)
        .bind(consumer)
        .bind(delivered_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(Error::InvariantViolation(format!(
                "job {} is past the cursor but already pending",
                record.id
            )));
        }
        tx.commit().await?;

        Ok(Some(Delivery {
            entry: PendingEntry {
                job_id: record.id,
                consumer_id: consumer.to_string(),
                delivered_at,
                delivery_count: 1,
            },
            record,
        }))
    }

    async fn claim_stale(
        &self,
        keys: &QueueKeys,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(min_idle)
                .map_err(|e| Error::Other(format!("idle threshold out of range: {e}")))?;

        let mut tx = self.pool.begin().await?;
        require_group(&mut tx, keys, false).await?;

        loop {
            let row = sqlx::query_as::<_, PendingRow>(
                "SELECT id_ms, id_seq, consumer, delivered_at, delivery_count FROM pending_entries
                 WHERE stream = $1 AND grp = $2 AND delivered_at <= $3
                 ORDER BY delivered_at, id_ms, id_seq
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(&keys.stream)
            .bind(&keys.group)
            .bind(cutoff)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                tx.commit().await?;
                return Ok(None);
            };
            let stale = row.try_into_entry()?;

            match fetch_record(&mut tx, &keys.stream, stale.job_id, false).await? {
                Some(record) if !record.is_retired() => {
                    let (ms, seq) = id_cols(stale.job_id)?;
                    sqlx::query(
                        "UPDATE pending_entries
                         SET consumer = $5, delivered_at = $6, delivery_count = delivery_count + 1
                         WHERE stream = $1 AND grp = $2 AND id_ms = $3 AND id_seq = $4",
                    )
                    .bind(&keys.stream)
                    .bind(&keys.group)
                    .bind(ms)
                    .bind(seq)
                    .bind(consumer)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;

                    return Ok(Some(Delivery {
                        record,
                        entry: PendingEntry {
                            consumer_id: consumer.to_string(),
                            delivered_at: now,
                            delivery_count: stale.delivery_count + 1,
                            ..stale
                        },
                    }));
                }
                _ => {
                    debug!(job_id = %stale.job_id, "dropping pending entry without live record");
                    delete_pending(&mut tx, keys, stale.job_id).await?;
                }
            }
        }
    }

    async fn ack(&self, keys: &QueueKeys, id: JobId) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if delete_pending(&mut conn, keys, id).await? {
            Ok(())
        } else {
            Err(Error::UnknownPendingEntry(id))
        }
    }

    async fn record_outcome(&self, keys: &QueueKeys, result: &JobResult) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        insert_result(&mut conn, &keys.stream, result).await
    }

    async fn complete(&self, keys: &QueueKeys, result: &JobResult) -> Result<Completion> {
        let mut tx = self.pool.begin().await?;
        let had_entry = delete_pending(&mut tx, keys, result.job_id).await?;

        let (ms, seq) = id_cols(result.job_id)?;
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM job_results WHERE stream = $1 AND id_ms = $2 AND id_seq = $3)",
        )
        .bind(&keys.stream)
        .bind(ms)
        .bind(seq)
        .fetch_one(&mut *tx)
        .await?;

        if exists {
            tx.commit().await?;
            return Ok(Completion::AlreadyRecorded);
        }
        if !had_entry {
            // dropping the transaction rolls it back; nothing was written
            return Err(Error::UnknownPendingEntry(result.job_id));
        }
        insert_result(&mut tx, &keys.stream, result).await?;
        tx.commit().await?;
        Ok(Completion::Recorded)
    }

    async fn pending(&self, keys: &QueueKeys, max: usize) -> Result<Vec<PendingEntry>> {
        let mut conn = self.pool.acquire().await?;
        require_group(&mut conn, keys, false).await?;
        sqlx::query_as::<_, PendingRow>(
            "SELECT id_ms, id_seq, consumer, delivered_at, delivery_count FROM pending_entries
             WHERE stream = $1 AND grp = $2
             ORDER BY delivered_at, id_ms, id_seq
             LIMIT $3",
        )
        .bind(&keys.stream)
        .bind(&keys.group)
        .bind(limit(max))
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(PendingRow::try_into_entry)
        .collect()
    }

    async fn requeue(&self, keys: &QueueKeys, id: JobId) -> Result<RequeueResult> {
        let mut tx = self.pool.begin().await?;
        lock_stream(&mut tx, &keys.stream).await?;
        require_group(&mut tx, keys, false).await?;
        let original = fetch_record(&mut tx, &keys.stream, id, true).await?;
        delete_pending(&mut tx, keys, id).await?;

        let Some(original) = original else {
            tx.commit().await?;
            return Err(Error::SourceRecordMissing(id));
        };
        if let Some(new_id) = original.retired_by {
            tx.commit().await?;
            return Ok(RequeueResult::AlreadyRequeued {
                original: id,
                new_id,
            });
        }

        // A copy without a retired original is a half-applied requeue from
        // an earlier schema or manual edit; finish it instead of copying twice.
        let existing: Option<(i64, i64)> = sqlx::query_as(
            "SELECT id_ms, id_seq FROM job_log WHERE stream = $1 AND requeued_from = $2",
        )
        .bind(&keys.stream)
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let (new_id, resumed) = match existing {
            Some((ms, seq)) => (decode_id("id", ms, seq)?, true),
            None => (append_on(&mut tx, &keys.stream, &original.requeue_copy()).await?.id, false),
        };

        let (ms, seq) = id_cols(id)?;
        sqlx::query("UPDATE job_log SET retired_by = $4 WHERE stream = $1 AND id_ms = $2 AND id_seq = $3")
            .bind(&keys.stream)
            .bind(ms)
            .bind(seq)
            .bind(new_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if resumed {
            warn!(original = %id, %new_id, "resumed a half-applied requeue");
            return Ok(RequeueResult::AlreadyRequeued {
                original: id,
                new_id,
            });
        }
        Ok(RequeueResult::Requeued {
            original: id,
            new_id,
        })
    }

    async fn completed(&self, keys: &QueueKeys, max: usize) -> Result<Vec<JobResult>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT detail FROM job_results
             WHERE stream = $1
             ORDER BY recorded_at DESC, seq DESC
             LIMIT $2",
        )
        .bind(&keys.stream)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|(detail,)| decode_result(detail)).collect()
    }

    async fn result(&self, keys: &QueueKeys, id: JobId) -> Result<Option<JobResult>> {
        let (ms, seq) = id_cols(id)?;
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT detail FROM job_results WHERE stream = $1 AND id_ms = $2 AND id_seq = $3",
        )
        .bind(&keys.stream)
        .bind(ms)
        .bind(seq)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(detail,)| decode_result(detail)).transpose()
    }
}
