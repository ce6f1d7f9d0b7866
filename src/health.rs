//! Engine health snapshot, published once per second.

use serde::Serialize;
use time::OffsetDateTime;

use crate::store::WriterStats;
use crate::transport::TransportStats;
use crate::types::{ExperimentState, PerPost};

/// Per-post slice of the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PostHealth {
    pub state: ExperimentState,
    pub experiment_id: Option<String>,
    /// Counted anomalies of the current run (NoData, DeltaSpike,
    /// QualityBad, QualityDegraded).
    pub anomaly_count: u64,
}

impl Default for PostHealth {
    fn default() -> Self {
        Self {
            state: ExperimentState::Idle,
            experiment_id: None,
            anomaly_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    /// Channels in the catalogue.
    pub channel_count: usize,
    /// Samples routed during the last tick.
    pub samples_per_sec: u64,
    pub link: TransportStats,
    pub writer: WriterStats,
    pub posts: PerPost<PostHealth>,
}
