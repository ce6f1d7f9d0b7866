//! Experiment parameters and per-run channel setup.

use rustc_hash::FxHashMap;
use time::OffsetDateTime;

use crate::detector::ChannelRule;
use crate::registry::ChannelRegistry;
use crate::store::{ChannelConfigRow, ExperimentRow, UiChannelConfig};
use crate::types::{ExperimentState, PostId};

/// What the operator enters when starting a run.
#[derive(Debug, Clone)]
pub struct ExperimentSpec {
    pub name: String,
    pub operator: String,
    pub part: String,
    pub refrigerant: String,
    pub batch_size: u32,
    /// Window length for standard channels; high-precision channels run
    /// at half of it.
    pub agg_interval_secs: u32,
    pub checkpoint_interval_secs: u32,
}

impl Default for ExperimentSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            operator: String::new(),
            part: String::new(),
            refrigerant: String::new(),
            batch_size: 100,
            agg_interval_secs: crate::aggregator::STANDARD_INTERVAL_SECS,
            checkpoint_interval_secs: 30,
        }
    }
}

impl ExperimentSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub(super) fn to_row(&self, id: &str, post: PostId, now: OffsetDateTime) -> ExperimentRow {
        ExperimentRow {
            id: id.to_string(),
            post: Some(post),
            name: self.name.clone(),
            operator: self.operator.clone(),
            part: self.part.clone(),
            refrigerant: self.refrigerant.clone(),
            state: ExperimentState::Running,
            start_time: now,
            end_time: None,
            batch_size: self.batch_size.max(1),
            agg_interval_secs: self.agg_interval_secs.max(1),
            checkpoint_interval_secs: self.checkpoint_interval_secs.max(1),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Merges catalogue defaults with the UI overrides into detector rules,
/// aggregation intervals and the persisted channel snapshot.
pub(super) fn build_channel_setup(
    registry: &ChannelRegistry,
    overrides: &FxHashMap<u16, UiChannelConfig>,
    channels: &[u16],
    spec: &ExperimentSpec,
) -> (Vec<ChannelRule>, FxHashMap<u16, u32>, Vec<ChannelConfigRow>) {
    let standard = spec.agg_interval_secs.max(1);
    let high_precision_interval = (standard / 2).max(1);
    let mut rules = Vec::with_capacity(channels.len());
    let mut intervals = FxHashMap::default();
    let mut config_rows = Vec::with_capacity(channels.len());

    for &channel in channels {
        let Some(def) = registry.get(channel) else {
            continue;
        };
        let override_cfg = overrides.get(&channel);
        let name = override_cfg
            .and_then(|c| c.alias.as_deref())
            .filter(|alias| !alias.is_empty())
            .unwrap_or(&def.name)
            .to_string();
        let min_limit = override_cfg.and_then(|c| c.min_limit).or(def.min_limit);
        let max_limit = override_cfg.and_then(|c| c.max_limit).or(def.max_limit);
        let high_precision = override_cfg
            .map(|c| c.high_precision)
            .unwrap_or(def.high_precision);
        let interval = if high_precision {
            high_precision_interval
        } else {
            standard
        };

        rules.push(ChannelRule::new(channel, name.clone()).with_limits(min_limit, max_limit));
        intervals.insert(channel, interval);
        config_rows.push(ChannelConfigRow {
            channel,
            name,
            group: def.group.as_str().to_string(),
            channel_type: def.unit.to_string(),
            min_limit,
            max_limit,
            enabled: true,
            high_precision,
            agg_interval_secs: Some(interval),
        });
    }

    (rules, intervals, config_rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_catalogue_defaults() {
        let registry = ChannelRegistry::bootstrap().unwrap();
        let mut overrides = FxHashMap::default();
        overrides.insert(
            0,
            UiChannelConfig {
                channel: 0,
                min_limit: Some(2.5),
                max_limit: None,
                alias: Some("suction".to_string()),
                high_precision: false,
            },
        );
        let spec = ExperimentSpec::default();
        let (rules, intervals, rows) =
            build_channel_setup(&registry, &overrides, &[0, 16], &spec);
        // Channel 0 is a pressure: overridden name, limit and precision.
        assert_eq!(rules[0].name, "suction");
        assert_eq!(rules[0].min_limit, Some(2.5));
        assert_eq!(intervals[&0], 20);
        // Channel 16 keeps catalogue defaults.
        assert_eq!(rules[1].name, "PA.T01");
        assert_eq!(intervals[&16], 20);
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].high_precision);
    }

    #[test]
    fn high_precision_halves_the_interval() {
        let registry = ChannelRegistry::bootstrap().unwrap();
        let overrides = FxHashMap::default();
        let spec = ExperimentSpec::default();
        let (_, intervals, _) = build_channel_setup(&registry, &overrides, &[0], &spec);
        assert_eq!(intervals[&0], 10);
    }
}
