//! Schema bootstrap, additive upgrades and the post-id backfill.
//!
//! Bootstrap failure is the one fatal error of the engine: a store that
//! cannot reach the expected shape aborts startup (§ error policy).

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::ChannelRegistry;
use crate::types::PostId;

/// Tables created when missing. Identifiers follow the legacy contract,
/// including the quoted `"group"`/`"type"` columns.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS experiments (
        id TEXT PRIMARY KEY,
        post_id TEXT,
        name TEXT NOT NULL,
        operator TEXT NOT NULL DEFAULT '',
        part TEXT NOT NULL DEFAULT '',
        refrigerant TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        batch_size INTEGER NOT NULL DEFAULT 100,
        agg_interval_sec INTEGER NOT NULL DEFAULT 20,
        checkpoint_interval_sec INTEGER NOT NULL DEFAULT 30,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS channel_config (
        experiment_id TEXT NOT NULL REFERENCES experiments(id),
        channel_index INTEGER NOT NULL,
        name TEXT NOT NULL,
        \"group\" TEXT NOT NULL DEFAULT '',
        \"type\" TEXT NOT NULL DEFAULT '',
        min_limit REAL,
        max_limit REAL,
        enabled INTEGER NOT NULL DEFAULT 1,
        high_precision INTEGER NOT NULL DEFAULT 0,
        agg_interval_sec INTEGER,
        PRIMARY KEY (experiment_id, channel_index)
    )",
    "CREATE TABLE IF NOT EXISTS raw_samples (
        experiment_id TEXT NOT NULL REFERENCES experiments(id),
        timestamp TEXT NOT NULL,
        channel_index INTEGER NOT NULL,
        value REAL NOT NULL,
        is_valid INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE INDEX IF NOT EXISTS idx_raw_samples_exp_ts
        ON raw_samples (experiment_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS agg_samples_20s (
        experiment_id TEXT NOT NULL REFERENCES experiments(id),
        timestamp TEXT NOT NULL,
        channel_index INTEGER NOT NULL,
        min REAL NOT NULL,
        max REAL NOT NULL,
        avg REAL NOT NULL,
        sample_count INTEGER NOT NULL,
        invalid_count INTEGER NOT NULL DEFAULT 0,
        quality_flag INTEGER NOT NULL DEFAULT 1,
        agg_window_sec INTEGER NOT NULL DEFAULT 20,
        UNIQUE (experiment_id, timestamp, channel_index)
    )",
    "CREATE TABLE IF NOT EXISTS anomaly_events (
        experiment_id TEXT NOT NULL REFERENCES experiments(id),
        timestamp TEXT NOT NULL,
        channel_index INTEGER NOT NULL,
        channel_name TEXT NOT NULL,
        anomaly_type TEXT NOT NULL,
        value REAL,
        threshold REAL,
        duration_sec REAL,
        is_acknowledged INTEGER NOT NULL DEFAULT 0,
        acknowledged_at TEXT,
        acknowledged_by TEXT,
        context_json TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_anomaly_events_exp
        ON anomaly_events (experiment_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS system_events (
        experiment_id TEXT,
        timestamp TEXT NOT NULL,
        event_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        source TEXT NOT NULL,
        correlation_id TEXT,
        details_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        experiment_id TEXT NOT NULL REFERENCES experiments(id),
        checkpoint_time TEXT NOT NULL,
        last_sample_timestamp TEXT,
        last_sample_id INTEGER,
        queue_state_json TEXT,
        statistics_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS post_channel_assignment (
        post_id TEXT NOT NULL,
        channel_index INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (post_id, channel_index)
    )",
    "CREATE TABLE IF NOT EXISTS post_channel_selection (
        post_id TEXT NOT NULL,
        channel_index INTEGER NOT NULL,
        is_selected INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (post_id, channel_index)
    )",
    "CREATE TABLE IF NOT EXISTS ui_channel_config (
        channel_index INTEGER PRIMARY KEY,
        min_limit REAL,
        max_limit REAL,
        alias TEXT,
        high_precision INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    )",
];

/// Columns added to stores created before they existed. Additive only.
const UPGRADES: &[(&str, &str, &str)] = &[
    ("experiments", "post_id", "TEXT"),
    ("agg_samples_20s", "agg_window_sec", "INTEGER NOT NULL DEFAULT 20"),
    ("channel_config", "agg_interval_sec", "INTEGER"),
    ("ui_channel_config", "alias", "TEXT"),
    ("ui_channel_config", "high_precision", "INTEGER NOT NULL DEFAULT 0"),
];

pub(super) fn bootstrap(conn: &Connection, registry: &ChannelRegistry) -> Result<()> {
    for ddl in SCHEMA {
        conn.execute(ddl, [])?;
    }
    for (table, column, ddl) in UPGRADES {
        ensure_column(conn, table, column, ddl)?;
    }
    backfill_post_ids(conn, registry)?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut present = false;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            present = true;
            break;
        }
    }
    if !present {
        info!(table, column, "adding missing column");
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"), [])?;
    }
    Ok(())
}

/// Assigns a post to experiments recorded before `post_id` existed.
///
/// Strategies in order: majority of the experiment's raw channel indices
/// mapped through the registry groups, majority of its stored channel
/// groups, then a token search over the experiment name. Anything still
/// ambiguous stays NULL.
fn backfill_post_ids(conn: &Connection, registry: &ChannelRegistry) -> Result<()> {
    let orphans: Vec<(String, String)> = {
        let mut stmt = conn.prepare("SELECT id, name FROM experiments WHERE post_id IS NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for (id, name) in orphans {
        let assigned = majority_from_raw_samples(conn, registry, &id)?
            .or(majority_from_channel_config(conn, &id)?)
            .or_else(|| post_from_name(&name));
        match assigned {
            Some(post) => {
                debug!(experiment = %id, post = %post, "backfilled post id");
                conn.execute(
                    "UPDATE experiments SET post_id = ?1 WHERE id = ?2",
                    rusqlite::params![post.as_str(), id],
                )?;
            }
            None => warn!(experiment = %id, "cannot infer post id, leaving NULL"),
        }
    }
    Ok(())
}

fn majority_from_raw_samples(
    conn: &Connection,
    registry: &ChannelRegistry,
    experiment_id: &str,
) -> Result<Option<PostId>> {
    let mut stmt = conn.prepare(
        "SELECT channel_index, COUNT(*) FROM raw_samples
         WHERE experiment_id = ?1 GROUP BY channel_index",
    )?;
    let mut votes = [0i64; 3];
    let mut rows = stmt.query([experiment_id])?;
    while let Some(row) = rows.next()? {
        let channel: u16 = row.get(0)?;
        let count: i64 = row.get(1)?;
        if let Some(post) = registry.get(channel).and_then(|d| d.group.post()) {
            votes[post as usize] += count;
        }
    }
    Ok(unique_majority(&votes))
}

fn majority_from_channel_config(conn: &Connection, experiment_id: &str) -> Result<Option<PostId>> {
    let mut stmt = conn.prepare(
        "SELECT \"group\", COUNT(*) FROM channel_config
         WHERE experiment_id = ?1 GROUP BY \"group\"",
    )?;
    let mut votes = [0i64; 3];
    let mut rows = stmt.query([experiment_id])?;
    while let Some(row) = rows.next()? {
        let group: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        if let Some(post) = crate::registry::ChannelGroup::parse(&group).and_then(|g| g.post()) {
            votes[post as usize] += count;
        }
    }
    Ok(unique_majority(&votes))
}

fn unique_majority(votes: &[i64; 3]) -> Option<PostId> {
    let best = *votes.iter().max()?;
    if best == 0 {
        return None;
    }
    let winners: Vec<usize> = (0..3).filter(|&i| votes[i] == best).collect();
    match winners.as_slice() {
        [0] => Some(PostId::A),
        [1] => Some(PostId::B),
        [2] => Some(PostId::C),
        _ => None,
    }
}

/// Looks for a standalone A/B/C token (for example "Post A" or "banco B")
/// in the experiment name.
fn post_from_name(name: &str) -> Option<PostId> {
    let lowered = name.to_lowercase();
    let mut found: Option<PostId> = None;
    for token in lowered.split(|c: char| !c.is_alphanumeric()) {
        let post = match token {
            "a" => Some(PostId::A),
            "b" => Some(PostId::B),
            "c" => Some(PostId::C),
            _ => None,
        };
        if let Some(post) = post {
            if found.is_some() && found != Some(post) {
                return None;
            }
            found = Some(post);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_token_search() {
        assert_eq!(post_from_name("Post A compressor run"), Some(PostId::A));
        assert_eq!(post_from_name("banco b"), Some(PostId::B));
        assert_eq!(post_from_name("C"), Some(PostId::C));
        assert_eq!(post_from_name("cycle test"), None);
        assert_eq!(post_from_name("A vs B"), None);
    }

    #[test]
    fn majority_requires_a_unique_winner() {
        assert_eq!(unique_majority(&[3, 1, 0]), Some(PostId::A));
        assert_eq!(unique_majority(&[2, 2, 0]), None);
        assert_eq!(unique_majority(&[0, 0, 0]), None);
    }
}
