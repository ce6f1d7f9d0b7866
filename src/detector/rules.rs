//! Per-channel detection rules.

use time::Duration;

use crate::registry::ChannelDef;

pub const DEFAULT_DEBOUNCE: u32 = 3;
pub const DEFAULT_NO_DATA_TIMEOUT: Duration = Duration::seconds(10);

/// Rule set for one channel, supplied by the coordinator at experiment
/// start. Disabled rules are ignored entirely.
#[derive(Debug, Clone)]
pub struct ChannelRule {
    pub channel: u16,
    /// Display name snapshot used in emitted events.
    pub name: String,
    pub enabled: bool,
    pub min_limit: Option<f64>,
    pub max_limit: Option<f64>,
    /// Band that must be re-crossed before a violation clears.
    pub hysteresis: f64,
    /// Consecutive crossings required before a violation opens.
    pub debounce: u32,
    /// Absolute sample-to-sample change that flags a spike.
    pub max_delta: Option<f64>,
    pub no_data_timeout: Option<Duration>,
}

impl ChannelRule {
    pub fn new(channel: u16, name: impl Into<String>) -> Self {
        Self {
            channel,
            name: name.into(),
            enabled: true,
            min_limit: None,
            max_limit: None,
            hysteresis: 0.0,
            debounce: DEFAULT_DEBOUNCE,
            max_delta: None,
            no_data_timeout: Some(DEFAULT_NO_DATA_TIMEOUT),
        }
    }

    /// Seeds a rule from the catalogue entry's limits.
    pub fn from_def(def: &ChannelDef) -> Self {
        let mut rule = Self::new(def.index, def.name.clone());
        rule.min_limit = def.min_limit;
        rule.max_limit = def.max_limit;
        rule
    }

    pub fn with_limits(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_limit = min;
        self.max_limit = max;
        self
    }

    pub fn with_debounce(mut self, debounce: u32) -> Self {
        self.debounce = debounce.max(1);
        self
    }

    pub fn with_hysteresis(mut self, hysteresis: f64) -> Self {
        self.hysteresis = hysteresis;
        self
    }

    pub fn with_max_delta(mut self, max_delta: f64) -> Self {
        self.max_delta = Some(max_delta);
        self
    }

    pub fn with_no_data_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.no_data_timeout = timeout;
        self
    }
}
