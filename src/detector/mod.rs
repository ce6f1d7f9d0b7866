//! Per-post anomaly detection.
//!
//! Three families of state machines per channel: limit thresholds with
//! hysteresis and debounce, rate-of-change spikes, and absence-of-data
//! timeouts. Aggregate-quality classification rides on completed windows.
//!
//! One mutex serialises `check_value` (router thread) with
//! `check_timeouts` (maintenance loop); `check_aggregate` touches no
//! mutable per-channel state and runs unlocked.

mod events;
mod rules;

pub use events::{AnomalyEvent, AnomalyKind, DetectorOutcome, Severity};
pub use rules::{ChannelRule, DEFAULT_DEBOUNCE, DEFAULT_NO_DATA_TIMEOUT};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use time::OffsetDateTime;

use crate::aggregator::{Aggregate, QualityFlag};

#[derive(Debug)]
struct ChannelWatch {
    rule: ChannelRule,
    last_value: Option<f64>,
    /// Seeded with the rule-load instant so a channel that never produces
    /// data still trips NoData.
    last_seen: OffsetDateTime,
    min_streak: u32,
    max_streak: u32,
    active_min: bool,
    active_max: bool,
    active_no_data: bool,
}

impl ChannelWatch {
    fn new(rule: ChannelRule, now: OffsetDateTime) -> Self {
        Self {
            rule,
            last_value: None,
            last_seen: now,
            min_streak: 0,
            max_streak: 0,
            active_min: false,
            active_max: false,
            active_no_data: false,
        }
    }
}

/// Detection state for one post.
#[derive(Debug)]
pub struct AnomalyDetector {
    /// Channel names, immutable after rule load; safe to read unlocked.
    names: FxHashMap<u16, String>,
    watches: Mutex<FxHashMap<u16, ChannelWatch>>,
}

impl AnomalyDetector {
    /// Installs the rule set. `now` seeds every channel's last-seen time.
    pub fn new(rules: Vec<ChannelRule>, now: OffsetDateTime) -> Self {
        let mut names = FxHashMap::default();
        let mut watches = FxHashMap::default();
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            names.insert(rule.channel, rule.name.clone());
            watches.insert(rule.channel, ChannelWatch::new(rule, now));
        }
        Self {
            names,
            watches: Mutex::new(watches),
        }
    }

    fn name(&self, channel: u16) -> String {
        self.names
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| format!("ch{channel}"))
    }

    /// Runs the threshold, spike and data-restore machines for one valid
    /// reading. Channels outside the rule set are a no-op.
    pub fn check_value(&self, channel: u16, value: f64, at: OffsetDateTime) -> Vec<DetectorOutcome> {
        let mut watches = self.watches.lock();
        let Some(watch) = watches.get_mut(&channel) else {
            return Vec::new();
        };
        let name = watch.rule.name.clone();
        let mut out = Vec::new();

        if let Some(min) = watch.rule.min_limit {
            if value < min - watch.rule.hysteresis {
                watch.min_streak += 1;
                if watch.min_streak >= watch.rule.debounce && !watch.active_min {
                    watch.active_min = true;
                    out.push(DetectorOutcome::Open(
                        AnomalyEvent::open(
                            channel,
                            name.clone(),
                            AnomalyKind::MinViolation,
                            format!("{name} below minimum: {value} < {min}"),
                            at,
                        )
                        .with_value(value)
                        .with_threshold(min),
                    ));
                }
            } else {
                if watch.active_min {
                    watch.active_min = false;
                    out.push(DetectorOutcome::Close {
                        channel,
                        kind: AnomalyKind::MinViolation,
                        at,
                    });
                    if !watch.active_max {
                        out.push(DetectorOutcome::Instant(
                            AnomalyEvent::instant(
                                channel,
                                name.clone(),
                                AnomalyKind::LimitsRestored,
                                format!("{name} back within limits"),
                                at,
                            )
                            .with_value(value),
                        ));
                    }
                }
                watch.min_streak = 0;
            }
        }

        if let Some(max) = watch.rule.max_limit {
            if value > max + watch.rule.hysteresis {
                watch.max_streak += 1;
                if watch.max_streak >= watch.rule.debounce && !watch.active_max {
                    watch.active_max = true;
                    out.push(DetectorOutcome::Open(
                        AnomalyEvent::open(
                            channel,
                            name.clone(),
                            AnomalyKind::MaxViolation,
                            format!("{name} above maximum: {value} > {max}"),
                            at,
                        )
                        .with_value(value)
                        .with_threshold(max),
                    ));
                }
            } else {
                if watch.active_max {
                    watch.active_max = false;
                    out.push(DetectorOutcome::Close {
                        channel,
                        kind: AnomalyKind::MaxViolation,
                        at,
                    });
                    if !watch.active_min {
                        out.push(DetectorOutcome::Instant(
                            AnomalyEvent::instant(
                                channel,
                                name.clone(),
                                AnomalyKind::LimitsRestored,
                                format!("{name} back within limits"),
                                at,
                            )
                            .with_value(value),
                        ));
                    }
                }
                watch.max_streak = 0;
            }
        }

        if let (Some(max_delta), Some(last)) = (watch.rule.max_delta, watch.last_value) {
            let delta = (value - last).abs();
            if delta > max_delta {
                // Spikes are standalone; each one is its own event.
                out.push(DetectorOutcome::Instant(
                    AnomalyEvent::instant(
                        channel,
                        name.clone(),
                        AnomalyKind::DeltaSpike,
                        format!("{name} jumped by {delta:.3} (limit {max_delta})"),
                        at,
                    )
                    .with_value(value)
                    .with_threshold(max_delta)
                    .with_delta(delta),
                ));
            }
        }

        watch.last_value = Some(value);
        watch.last_seen = at;

        if watch.active_no_data {
            // Close immediately; the periodic scan must not race this.
            watch.active_no_data = false;
            out.push(DetectorOutcome::Close {
                channel,
                kind: AnomalyKind::NoData,
                at,
            });
            out.push(DetectorOutcome::Instant(
                AnomalyEvent::instant(
                    channel,
                    name.clone(),
                    AnomalyKind::DataRestored,
                    format!("{name} data restored"),
                    at,
                )
                .with_value(value),
            ));
        }

        out
    }

    /// Periodic no-data scan, driven by the maintenance loop.
    pub fn check_timeouts(&self, now: OffsetDateTime) -> Vec<DetectorOutcome> {
        let mut watches = self.watches.lock();
        let mut out = Vec::new();
        for (&channel, watch) in watches.iter_mut() {
            let Some(timeout) = watch.rule.no_data_timeout else {
                continue;
            };
            let silent_for = now - watch.last_seen;
            if silent_for > timeout && !watch.active_no_data {
                watch.active_no_data = true;
                let name = &watch.rule.name;
                out.push(DetectorOutcome::Open(
                    AnomalyEvent::open(
                        channel,
                        name,
                        AnomalyKind::NoData,
                        format!(
                            "{name}: no data for {}s",
                            silent_for.whole_seconds()
                        ),
                        now,
                    )
                    .with_threshold(timeout.as_seconds_f64()),
                ));
            } else if silent_for <= timeout && watch.active_no_data {
                watch.active_no_data = false;
                let name = &watch.rule.name;
                out.push(DetectorOutcome::Close {
                    channel,
                    kind: AnomalyKind::NoData,
                    at: now,
                });
                out.push(DetectorOutcome::Instant(AnomalyEvent::instant(
                    channel,
                    name,
                    AnomalyKind::DataRestored,
                    format!("{name} data restored"),
                    now,
                )));
            }
        }
        out
    }

    /// Quality classification of a completed window. Reads no mutable
    /// per-channel state.
    pub fn check_aggregate(&self, agg: &Aggregate) -> Vec<DetectorOutcome> {
        let name = self.name(agg.channel);
        let at = agg.window_end();
        match agg.quality {
            QualityFlag::Ok => Vec::new(),
            QualityFlag::Degraded => vec![DetectorOutcome::Instant(
                AnomalyEvent::instant(
                    agg.channel,
                    name.clone(),
                    AnomalyKind::QualityDegraded,
                    format!(
                        "{name}: {}/{} invalid readings in window",
                        agg.invalid_count,
                        agg.total_count()
                    ),
                    at,
                )
                .with_value(agg.avg),
            )],
            QualityFlag::Bad => vec![DetectorOutcome::Instant(
                AnomalyEvent::instant(
                    agg.channel,
                    name.clone(),
                    AnomalyKind::QualityBad,
                    format!(
                        "{name}: {}/{} invalid readings in window",
                        agg.invalid_count,
                        agg.total_count()
                    ),
                    at,
                )
                .with_value(agg.avg),
            )],
        }
    }

    /// Number of channels with any active sticky event.
    pub fn active_channels(&self) -> usize {
        self.watches
            .lock()
            .values()
            .filter(|w| w.active_min || w.active_max || w.active_no_data)
            .count()
    }
}
