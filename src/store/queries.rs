//! Read paths and configuration tables.
//!
//! Policy: a runtime query failure on a read path logs and returns an
//! empty result; writes propagate their error to the caller.

use rusqlite::{params, Row};
use time::OffsetDateTime;
use tracing::error;

use crate::clock::{format_ts, parse_ts};
use crate::error::Result;
use crate::types::{ExperimentState, PerPost, PostId};

use super::{ExperimentRow, Store};

/// Optional filters for experiment listings.
#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    pub state: Option<ExperimentState>,
    /// Case-insensitive substring of the experiment name.
    pub name_like: Option<String>,
}

/// One raw reading as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub experiment_id: String,
    pub timestamp: OffsetDateTime,
    pub channel: u16,
    pub value: f64,
    pub is_valid: bool,
}

/// One aggregate row as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAggregate {
    pub experiment_id: String,
    pub window_start: OffsetDateTime,
    pub channel: u16,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub sample_count: u32,
    pub invalid_count: u32,
    pub quality_flag: i8,
    pub window_secs: u32,
}

/// Anomaly event row; `id` is the store rowid used for acknowledgement.
#[derive(Debug, Clone)]
pub struct AnomalyEventRow {
    pub id: i64,
    pub experiment_id: String,
    pub timestamp: OffsetDateTime,
    pub channel: u16,
    pub channel_name: String,
    pub anomaly_type: String,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub duration_secs: Option<f64>,
    pub is_acknowledged: bool,
    pub acknowledged_at: Option<OffsetDateTime>,
    pub acknowledged_by: Option<String>,
    pub context_json: Option<String>,
}

/// Per-channel overrides applied on top of the registry defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiChannelConfig {
    pub channel: u16,
    pub min_limit: Option<f64>,
    pub max_limit: Option<f64>,
    pub alias: Option<String>,
    pub high_precision: bool,
}

pub(super) fn map_experiment_row(row: &Row<'_>) -> rusqlite::Result<ExperimentRow> {
    let state_raw: String = row.get(6)?;
    let start_raw: String = row.get(7)?;
    let end_raw: Option<String> = row.get(8)?;
    let created_raw: String = row.get(12)?;
    let updated_raw: String = row.get(13)?;
    let post_raw: Option<String> = row.get(1)?;
    Ok(ExperimentRow {
        id: row.get(0)?,
        post: post_raw.as_deref().and_then(PostId::parse),
        name: row.get(2)?,
        operator: row.get(3)?,
        part: row.get(4)?,
        refrigerant: row.get(5)?,
        state: ExperimentState::parse(&state_raw).unwrap_or(ExperimentState::Idle),
        start_time: parse_ts(&start_raw).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        end_time: end_raw.as_deref().and_then(parse_ts),
        batch_size: row.get(9)?,
        agg_interval_secs: row.get(10)?,
        checkpoint_interval_secs: row.get(11)?,
        created_at: parse_ts(&created_raw).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        updated_at: parse_ts(&updated_raw).unwrap_or(OffsetDateTime::UNIX_EPOCH),
    })
}

const EXPERIMENT_COLUMNS: &str = "id, post_id, name, operator, part, refrigerant, state, \
     start_time, end_time, batch_size, agg_interval_sec, \
     checkpoint_interval_sec, created_at, updated_at";

fn log_and_empty<T>(context: &str, err: rusqlite::Error) -> Vec<T> {
    error!(%err, "{context} read failed");
    Vec::new()
}

impl Store {
    pub fn experiment(&self, id: &str) -> Option<ExperimentRow> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE id = ?1"),
            params![id],
            map_experiment_row,
        )
        .map(Some)
        .unwrap_or_else(|err| {
            if !matches!(err, rusqlite::Error::QueryReturnedNoRows) {
                error!(%err, "experiment read failed");
            }
            None
        })
    }

    /// Experiments recorded for one post, newest first.
    pub fn experiments_for_post(
        &self,
        post: PostId,
        filter: &ExperimentFilter,
    ) -> Vec<ExperimentRow> {
        let conn = self.conn.lock();
        let post_key = post.as_str().to_string();
        let state_key = filter.state.map(|s| s.as_str().to_string());
        let name_pattern = filter.name_like.as_deref().map(|s| format!("%{s}%"));
        let run = || -> rusqlite::Result<Vec<ExperimentRow>> {
            let mut sql =
                format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE post_id = ?");
            let mut binds: Vec<&dyn rusqlite::ToSql> = vec![&post_key];
            if let Some(state) = &state_key {
                sql.push_str(" AND state = ?");
                binds.push(state);
            }
            if let Some(pattern) = &name_pattern {
                sql.push_str(" AND name LIKE ? COLLATE NOCASE");
                binds.push(pattern);
            }
            sql.push_str(" ORDER BY start_time DESC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&binds[..], map_experiment_row)?;
            rows.collect()
        };
        run().unwrap_or_else(|err| log_and_empty("experiments", err))
    }

    /// Raw history for one channel of one experiment, oldest first.
    pub fn channel_history(
        &self,
        experiment_id: &str,
        channel: u16,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Vec<HistoryPoint> {
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<Vec<HistoryPoint>> {
            let mut stmt = conn.prepare_cached(
                "SELECT experiment_id, timestamp, channel_index, value, is_valid
                 FROM raw_samples
                 WHERE experiment_id = ?1 AND channel_index = ?2
                   AND timestamp >= ?3 AND timestamp <= ?4
                 ORDER BY timestamp",
            )?;
            let from = from.map(format_ts).unwrap_or_else(|| "0000".into());
            let to = to.map(format_ts).unwrap_or_else(|| "9999".into());
            let rows = stmt.query_map(params![experiment_id, channel, from, to], map_history)?;
            rows.collect()
        };
        run().unwrap_or_else(|err| log_and_empty("channel history", err))
    }

    /// Cross-experiment history for one channel in a time range.
    pub fn channel_history_across(
        &self,
        channel: u16,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Vec<HistoryPoint> {
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<Vec<HistoryPoint>> {
            let mut stmt = conn.prepare_cached(
                "SELECT experiment_id, timestamp, channel_index, value, is_valid
                 FROM raw_samples
                 WHERE channel_index = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(
                params![channel, format_ts(from), format_ts(to)],
                map_history,
            )?;
            rows.collect()
        };
        run().unwrap_or_else(|err| log_and_empty("cross history", err))
    }

    /// Aggregates for one channel of one experiment, oldest first.
    pub fn aggregates_for_channel(&self, experiment_id: &str, channel: u16) -> Vec<StoredAggregate> {
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<Vec<StoredAggregate>> {
            let mut stmt = conn.prepare_cached(
                "SELECT experiment_id, timestamp, channel_index, min, max, avg,
                        sample_count, invalid_count, quality_flag, agg_window_sec
                 FROM agg_samples_20s
                 WHERE experiment_id = ?1 AND channel_index = ?2
                 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(params![experiment_id, channel], |row| {
                let ts_raw: String = row.get(1)?;
                Ok(StoredAggregate {
                    experiment_id: row.get(0)?,
                    window_start: parse_ts(&ts_raw).unwrap_or(OffsetDateTime::UNIX_EPOCH),
                    channel: row.get(2)?,
                    min: row.get(3)?,
                    max: row.get(4)?,
                    avg: row.get(5)?,
                    sample_count: row.get(6)?,
                    invalid_count: row.get(7)?,
                    quality_flag: row.get(8)?,
                    window_secs: row.get(9)?,
                })
            })?;
            rows.collect()
        };
        run().unwrap_or_else(|err| log_and_empty("aggregates", err))
    }

    /// Anomaly events of one experiment, oldest first.
    pub fn events_for_experiment(&self, experiment_id: &str) -> Vec<AnomalyEventRow> {
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<Vec<AnomalyEventRow>> {
            let mut stmt = conn.prepare_cached(
                "SELECT rowid, experiment_id, timestamp, channel_index, channel_name,
                        anomaly_type, value, threshold, duration_sec,
                        is_acknowledged, acknowledged_at, acknowledged_by, context_json
                 FROM anomaly_events
                 WHERE experiment_id = ?1
                 ORDER BY timestamp, rowid",
            )?;
            let rows = stmt.query_map(params![experiment_id], |row| {
                let ts_raw: String = row.get(2)?;
                let ack_raw: Option<String> = row.get(10)?;
                Ok(AnomalyEventRow {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    timestamp: parse_ts(&ts_raw).unwrap_or(OffsetDateTime::UNIX_EPOCH),
                    channel: row.get(3)?,
                    channel_name: row.get(4)?,
                    anomaly_type: row.get(5)?,
                    value: row.get(6)?,
                    threshold: row.get(7)?,
                    duration_secs: row.get(8)?,
                    is_acknowledged: row.get(9)?,
                    acknowledged_at: ack_raw.as_deref().and_then(parse_ts),
                    acknowledged_by: row.get(11)?,
                    context_json: row.get(12)?,
                })
            })?;
            rows.collect()
        };
        run().unwrap_or_else(|err| log_and_empty("anomaly events", err))
    }

    /// First and last raw-sample timestamps of an experiment.
    pub fn data_range(&self, experiment_id: &str) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM raw_samples WHERE experiment_id = ?1",
            params![experiment_id],
            |row| {
                let min: Option<String> = row.get(0)?;
                let max: Option<String> = row.get(1)?;
                Ok(min.zip(max))
            },
        )
        .ok()
        .flatten()
        .and_then(|(min, max)| parse_ts(&min).zip(parse_ts(&max)))
    }

    // ── routing table ────────────────────────────────────────────────

    /// Replaces a post's channel assignment atomically
    /// (delete-then-insert). The list is deduplicated and ordered.
    pub fn write_routing(&self, post: PostId, channels: &[u16], at: OffsetDateTime) -> Result<()> {
        let mut ordered: Vec<u16> = channels.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM post_channel_assignment WHERE post_id = ?1",
            params![post.as_str()],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO post_channel_assignment (post_id, channel_index, updated_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for channel in &ordered {
                stmt.execute(params![post.as_str(), channel, format_ts(at)])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Channel assignments for all three posts, ordered by index.
    pub fn read_routing(&self) -> PerPost<Vec<u16>> {
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<PerPost<Vec<u16>>> {
            let mut out = PerPost::<Vec<u16>>::default();
            let mut stmt = conn.prepare_cached(
                "SELECT post_id, channel_index FROM post_channel_assignment
                 ORDER BY channel_index",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let post_raw: String = row.get(0)?;
                let channel: u16 = row.get(1)?;
                if let Some(post) = PostId::parse(&post_raw) {
                    out.get_mut(post).push(channel);
                }
            }
            Ok(out)
        };
        run().unwrap_or_else(|err| {
            error!(%err, "routing read failed");
            PerPost::default()
        })
    }

    /// Replaces a post's per-channel selection flags atomically.
    pub fn write_selection(
        &self,
        post: PostId,
        flags: &[(u16, bool)],
        at: OffsetDateTime,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM post_channel_selection WHERE post_id = ?1",
            params![post.as_str()],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO post_channel_selection
                    (post_id, channel_index, is_selected, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (channel, selected) in flags {
                stmt.execute(params![post.as_str(), channel, selected, format_ts(at)])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn read_selection(&self) -> PerPost<Vec<(u16, bool)>> {
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<PerPost<Vec<(u16, bool)>>> {
            let mut out = PerPost::<Vec<(u16, bool)>>::default();
            let mut stmt = conn.prepare_cached(
                "SELECT post_id, channel_index, is_selected FROM post_channel_selection
                 ORDER BY channel_index",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let post_raw: String = row.get(0)?;
                if let Some(post) = PostId::parse(&post_raw) {
                    out.get_mut(post).push((row.get(1)?, row.get(2)?));
                }
            }
            Ok(out)
        };
        run().unwrap_or_else(|err| {
            error!(%err, "selection read failed");
            PerPost::default()
        })
    }

    // ── UI channel config ────────────────────────────────────────────

    pub fn upsert_ui_channel_config(&self, cfg: &UiChannelConfig, at: OffsetDateTime) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ui_channel_config
                (channel_index, min_limit, max_limit, alias, high_precision, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(channel_index) DO UPDATE SET
                min_limit = excluded.min_limit,
                max_limit = excluded.max_limit,
                alias = excluded.alias,
                high_precision = excluded.high_precision,
                updated_at = excluded.updated_at",
            params![
                cfg.channel,
                cfg.min_limit,
                cfg.max_limit,
                cfg.alias,
                cfg.high_precision,
                format_ts(at),
            ],
        )?;
        Ok(())
    }

    pub fn ui_channel_configs(&self) -> Vec<UiChannelConfig> {
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<Vec<UiChannelConfig>> {
            let mut stmt = conn.prepare_cached(
                "SELECT channel_index, min_limit, max_limit, alias, high_precision
                 FROM ui_channel_config ORDER BY channel_index",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(UiChannelConfig {
                    channel: row.get(0)?,
                    min_limit: row.get(1)?,
                    max_limit: row.get(2)?,
                    alias: row.get(3)?,
                    high_precision: row.get(4)?,
                })
            })?;
            rows.collect()
        };
        run().unwrap_or_else(|err| log_and_empty("ui channel config", err))
    }
}

fn map_history(row: &Row<'_>) -> rusqlite::Result<HistoryPoint> {
    let ts_raw: String = row.get(1)?;
    Ok(HistoryPoint {
        experiment_id: row.get(0)?,
        timestamp: parse_ts(&ts_raw).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        channel: row.get(2)?,
        value: row.get(3)?,
        is_valid: row.get(4)?,
    })
}
