//! WAL-backed embedded store.
//!
//! One SQLite file holds every experiment's raw samples, aggregates,
//! anomaly events, system events, checkpoints and the routing/UI
//! configuration. A single connection behind a mutex gives the
//! at-most-one-writer guarantee; write transactions are short and never
//! overlap for the same batch.

mod queries;
mod schema;
mod writer;

pub use queries::{
    AnomalyEventRow, ExperimentFilter, HistoryPoint, StoredAggregate, UiChannelConfig,
};
pub use writer::{BatchWriter, BatchWriterConfig, QueueSnapshot, WriterStats};

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::aggregator::Aggregate;
use crate::clock::{format_ts, parse_ts};
use crate::detector::{AnomalyEvent, AnomalyKind};
use crate::error::Result;
use crate::registry::ChannelRegistry;
use crate::types::{ExperimentState, PostId};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// One raw sample row queued for persistence.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub experiment_id: String,
    pub timestamp: OffsetDateTime,
    pub channel: u16,
    /// Literal decoded value; sentinels are stored as-is for legacy parity.
    pub value: f64,
    pub is_valid: bool,
}

/// Experiment metadata as persisted.
#[derive(Debug, Clone)]
pub struct ExperimentRow {
    pub id: String,
    pub post: Option<PostId>,
    pub name: String,
    pub operator: String,
    pub part: String,
    pub refrigerant: String,
    pub state: ExperimentState,
    pub start_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
    pub batch_size: u32,
    pub agg_interval_secs: u32,
    pub checkpoint_interval_secs: u32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Channel configuration snapshot stored with each experiment.
#[derive(Debug, Clone)]
pub struct ChannelConfigRow {
    pub channel: u16,
    pub name: String,
    pub group: String,
    pub channel_type: String,
    pub min_limit: Option<f64>,
    pub max_limit: Option<f64>,
    pub enabled: bool,
    pub high_precision: bool,
    pub agg_interval_secs: Option<u32>,
}

/// Row for the operator-facing journal.
#[derive(Debug, Clone)]
pub struct SystemEventRow {
    pub experiment_id: Option<String>,
    pub timestamp: OffsetDateTime,
    pub event_type: String,
    pub severity: String,
    pub message: String,
    pub source: String,
    pub correlation_id: Option<String>,
    pub details_json: Option<String>,
}

/// Coordinator progress snapshot bounding crash loss.
#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub experiment_id: String,
    pub checkpoint_time: OffsetDateTime,
    pub last_sample_timestamp: Option<OffsetDateTime>,
    pub last_sample_id: Option<i64>,
    pub queue_state_json: String,
    pub statistics_json: String,
}

/// Handle to the embedded store.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the store and brings the schema up to
    /// date. Bootstrap failure is fatal to the process by policy; callers
    /// propagate this error to the top.
    pub fn open(path: impl AsRef<Path>, registry: &ChannelRegistry) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::bootstrap(&conn, registry)?;
        info!(path = %path.display(), "store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── experiments ──────────────────────────────────────────────────

    pub fn create_experiment(&self, row: &ExperimentRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO experiments
                (id, post_id, name, operator, part, refrigerant, state,
                 start_time, end_time, batch_size, agg_interval_sec,
                 checkpoint_interval_sec, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                row.id,
                row.post.map(PostId::as_str),
                row.name,
                row.operator,
                row.part,
                row.refrigerant,
                row.state.as_str(),
                format_ts(row.start_time),
                row.end_time.map(format_ts),
                row.batch_size,
                row.agg_interval_secs,
                row.checkpoint_interval_secs,
                format_ts(row.created_at),
                format_ts(row.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn set_experiment_state(
        &self,
        id: &str,
        state: ExperimentState,
        at: OffsetDateTime,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE experiments SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state.as_str(), format_ts(at), id],
        )?;
        Ok(())
    }

    /// Marks the experiment Finalized and stamps its end time.
    pub fn finalize_experiment(&self, id: &str, end_time: OffsetDateTime) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE experiments
             SET state = ?1, end_time = ?2, updated_at = ?2 WHERE id = ?3",
            params![ExperimentState::Finalized.as_str(), format_ts(end_time), id],
        )?;
        Ok(())
    }

    /// One-shot crash recovery: every experiment still Running or Paused
    /// is atomically marked Recovered and returned.
    pub fn recover_interrupted(&self, at: OffsetDateTime) -> Result<Vec<ExperimentRow>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut recovered = {
            let mut stmt = tx.prepare(
                "SELECT id, post_id, name, operator, part, refrigerant, state,
                        start_time, end_time, batch_size, agg_interval_sec,
                        checkpoint_interval_sec, created_at, updated_at
                 FROM experiments WHERE state IN ('Running', 'Paused')",
            )?;
            let rows = stmt.query_map([], queries::map_experiment_row)?;
            rows.collect::<rusqlite::Result<Vec<ExperimentRow>>>()?
        };
        tx.execute(
            "UPDATE experiments SET state = ?1, updated_at = ?2
             WHERE state IN ('Running', 'Paused')",
            params![ExperimentState::Recovered.as_str(), format_ts(at)],
        )?;
        tx.commit()?;
        for row in &mut recovered {
            row.state = ExperimentState::Recovered;
            row.updated_at = at;
        }
        Ok(recovered)
    }

    pub fn write_channel_configs(&self, experiment_id: &str, rows: &[ChannelConfigRow]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO channel_config
                    (experiment_id, channel_index, name, \"group\", \"type\",
                     min_limit, max_limit, enabled, high_precision, agg_interval_sec)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for row in rows {
                stmt.execute(params![
                    experiment_id,
                    row.channel,
                    row.name,
                    row.group,
                    row.channel_type,
                    row.min_limit,
                    row.max_limit,
                    row.enabled,
                    row.high_precision,
                    row.agg_interval_secs,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── samples and aggregates ───────────────────────────────────────

    /// Inserts a batch of raw rows in one transaction. Returns the row
    /// count and the rowid of the last insert.
    pub fn insert_raw_batch(&self, rows: &[RawRow]) -> Result<(u64, Option<i64>)> {
        if rows.is_empty() {
            return Ok((0, None));
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO raw_samples
                    (experiment_id, timestamp, channel_index, value, is_valid)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.experiment_id,
                    format_ts(row.timestamp),
                    row.channel,
                    row.value,
                    row.is_valid,
                ])?;
            }
        }
        let last_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok((rows.len() as u64, Some(last_id)))
    }

    /// Upserts completed aggregates; the uniqueness key is
    /// (experiment, window start, channel).
    pub fn insert_aggregates(&self, experiment_id: &str, aggregates: &[Aggregate]) -> Result<u64> {
        if aggregates.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO agg_samples_20s
                    (experiment_id, timestamp, channel_index, min, max, avg,
                     sample_count, invalid_count, quality_flag, agg_window_sec)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for agg in aggregates {
                stmt.execute(params![
                    experiment_id,
                    format_ts(agg.window_start),
                    agg.channel,
                    agg.min,
                    agg.max,
                    agg.avg,
                    agg.sample_count,
                    agg.invalid_count,
                    agg.quality.as_i8(),
                    agg.window_secs,
                ])?;
            }
        }
        tx.commit()?;
        Ok(aggregates.len() as u64)
    }

    // ── anomaly events ───────────────────────────────────────────────

    /// Persists a detector event. Instantaneous events are closed on
    /// insert (duration 0); sticky opens stay active until
    /// [`Store::close_anomaly`].
    pub fn record_anomaly(&self, experiment_id: &str, event: &AnomalyEvent) -> Result<i64> {
        let context = serde_json::json!({
            "severity": event.severity.as_str(),
            "message": event.message,
            "delta": event.delta,
        });
        let duration_secs = event
            .closed_at
            .map(|closed| (closed - event.opened_at).as_seconds_f64());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO anomaly_events
                (experiment_id, timestamp, channel_index, channel_name,
                 anomaly_type, value, threshold, duration_sec, context_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                experiment_id,
                format_ts(event.opened_at),
                event.channel,
                event.channel_name,
                event.kind.as_str(),
                event.value,
                event.threshold,
                duration_secs,
                context.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Closes the active event for (experiment, channel, kind), if any.
    /// Returns whether a row was closed.
    pub fn close_anomaly(
        &self,
        experiment_id: &str,
        channel: u16,
        kind: AnomalyKind,
        closed_at: OffsetDateTime,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let active: Option<(i64, String)> = conn
            .query_row(
                "SELECT rowid, timestamp FROM anomaly_events
                 WHERE experiment_id = ?1 AND channel_index = ?2
                   AND anomaly_type = ?3 AND duration_sec IS NULL
                 ORDER BY rowid DESC LIMIT 1",
                params![experiment_id, channel, kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some((rowid, opened_raw)) = active else {
            return Ok(false);
        };
        let duration = parse_ts(&opened_raw)
            .map(|opened| (closed_at - opened).as_seconds_f64().max(0.0))
            .unwrap_or(0.0);
        conn.execute(
            "UPDATE anomaly_events SET duration_sec = ?1 WHERE rowid = ?2",
            params![duration, rowid],
        )?;
        Ok(true)
    }

    /// Acknowledges an event and closes it if still active.
    pub fn acknowledge_anomaly(
        &self,
        event_id: i64,
        user: &str,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let opened_raw: Option<String> = conn
            .query_row(
                "SELECT timestamp FROM anomaly_events WHERE rowid = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(opened_raw) = opened_raw else {
            return Ok(false);
        };
        let duration = parse_ts(&opened_raw)
            .map(|opened| (at - opened).as_seconds_f64().max(0.0))
            .unwrap_or(0.0);
        conn.execute(
            "UPDATE anomaly_events
             SET is_acknowledged = 1, acknowledged_at = ?1, acknowledged_by = ?2,
                 duration_sec = COALESCE(duration_sec, ?3)
             WHERE rowid = ?4",
            params![format_ts(at), user, duration, event_id],
        )?;
        Ok(true)
    }

    // ── journal, checkpoints, maintenance ────────────────────────────

    pub fn insert_system_event(&self, row: &SystemEventRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_events
                (experiment_id, timestamp, event_type, severity, message,
                 source, correlation_id, details_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.experiment_id,
                format_ts(row.timestamp),
                row.event_type,
                row.severity,
                row.message,
                row.source,
                row.correlation_id,
                row.details_json,
            ],
        )?;
        Ok(())
    }

    pub fn insert_checkpoint(&self, row: &CheckpointRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO checkpoints
                (experiment_id, checkpoint_time, last_sample_timestamp,
                 last_sample_id, queue_state_json, statistics_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.experiment_id,
                format_ts(row.checkpoint_time),
                row.last_sample_timestamp.map(format_ts),
                row.last_sample_id,
                row.queue_state_json,
                row.statistics_json,
            ],
        )?;
        Ok(())
    }

    /// Passive WAL checkpoint; never blocks ongoing writers.
    pub fn wal_checkpoint_passive(&self) -> Result<()> {
        let conn = self.conn.lock();
        let result = conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| {
            let busy: i64 = row.get(0)?;
            Ok(busy)
        });
        match result {
            Ok(busy) if busy != 0 => {
                warn!("passive WAL checkpoint skipped, writer busy");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}
