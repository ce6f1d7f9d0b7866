//! Per-channel tumbling-window aggregation.
//!
//! Windows are aligned to the epoch: a sample at `t` lands in the window
//! starting at `floor(t / interval) * interval`. High-precision channels
//! get a shorter interval. Nothing is evicted on ingest; completed
//! windows leave through [`WindowAggregator::ready`] on the maintenance
//! cadence, or [`WindowAggregator::flush`] on stop.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::protocol::Sample;

/// Window length for ordinary channels.
pub const STANDARD_INTERVAL_SECS: u32 = 20;
/// Window length for high-precision channels.
pub const HIGH_PRECISION_INTERVAL_SECS: u32 = 10;
/// A window is handed out only once its end lies this far in the past,
/// absorbing late frames.
const GRACE_SECS: i64 = 2;

/// Discrete classification of a window's validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityFlag {
    Bad,
    Degraded,
    Ok,
}

impl QualityFlag {
    /// Persisted encoding: bad = -1, degraded = 0, ok = 1.
    pub fn as_i8(self) -> i8 {
        match self {
            QualityFlag::Bad => -1,
            QualityFlag::Degraded => 0,
            QualityFlag::Ok => 1,
        }
    }

    pub fn from_i8(v: i8) -> Option<QualityFlag> {
        match v {
            -1 => Some(QualityFlag::Bad),
            0 => Some(QualityFlag::Degraded),
            1 => Some(QualityFlag::Ok),
            _ => None,
        }
    }

    fn classify(invalid: u32, total: u32) -> QualityFlag {
        if total == 0 {
            return QualityFlag::Ok;
        }
        let ratio = invalid as f64 / total as f64;
        if ratio > 0.5 {
            QualityFlag::Bad
        } else if ratio > 0.1 {
            QualityFlag::Degraded
        } else {
            QualityFlag::Ok
        }
    }
}

/// One completed window for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub channel: u16,
    pub window_start: OffsetDateTime,
    pub window_secs: u32,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub first: f64,
    pub last: f64,
    pub std_dev: Option<f64>,
    pub sample_count: u32,
    pub invalid_count: u32,
    pub quality: QualityFlag,
}

impl Aggregate {
    pub fn total_count(&self) -> u32 {
        self.sample_count + self.invalid_count
    }

    pub fn window_end(&self) -> OffsetDateTime {
        self.window_start + time::Duration::seconds(i64::from(self.window_secs))
    }
}

#[derive(Debug, Default)]
struct Window {
    values: Vec<f64>,
    sum: f64,
    sum_sq: f64,
    invalid: u32,
}

impl Window {
    fn into_aggregate(self, channel: u16, start_unix: i64, interval: u32) -> Option<Aggregate> {
        if self.values.is_empty() {
            return None;
        }
        let count = self.values.len() as u32;
        let avg = self.sum / f64::from(count);
        let variance = (self.sum_sq / f64::from(count) - avg * avg).max(0.0);
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in &self.values {
            min = min.min(v);
            max = max.max(v);
        }
        let window_start = OffsetDateTime::from_unix_timestamp(start_unix).ok()?;
        Some(Aggregate {
            channel,
            window_start,
            window_secs: interval,
            min,
            max,
            avg,
            first: self.values[0],
            last: *self.values.last()?,
            std_dev: Some(variance.sqrt()),
            sample_count: count,
            invalid_count: self.invalid,
            quality: QualityFlag::classify(self.invalid, count + self.invalid),
        })
    }
}

#[derive(Debug)]
struct ChannelWindows {
    interval_secs: u32,
    windows: BTreeMap<i64, Window>,
}

/// Aggregation state for one post. Internally locked; safe to share
/// between the router thread and the maintenance loop.
#[derive(Debug)]
pub struct WindowAggregator {
    channels: Mutex<FxHashMap<u16, ChannelWindows>>,
}

impl WindowAggregator {
    /// `intervals` maps each recorded channel to its window length.
    pub fn new(intervals: FxHashMap<u16, u32>) -> Self {
        let channels = intervals
            .into_iter()
            .map(|(ch, interval_secs)| {
                (
                    ch,
                    ChannelWindows {
                        interval_secs: interval_secs.max(1),
                        windows: BTreeMap::new(),
                    },
                )
            })
            .collect();
        Self {
            channels: Mutex::new(channels),
        }
    }

    /// Convenience constructor applying the standard/high-precision split.
    pub fn for_channels(channels: impl IntoIterator<Item = (u16, bool)>) -> Self {
        Self::new(
            channels
                .into_iter()
                .map(|(ch, high_precision)| {
                    let interval = if high_precision {
                        HIGH_PRECISION_INTERVAL_SECS
                    } else {
                        STANDARD_INTERVAL_SECS
                    };
                    (ch, interval)
                })
                .collect(),
        )
    }

    /// Folds one sample into its window. Sentinels count as invalid;
    /// non-finite decodes are rejected outright.
    pub fn add_sample(&self, sample: &Sample) {
        if sample.raw.is_nan() || sample.raw.is_infinite() {
            return;
        }
        let mut channels = self.channels.lock();
        let Some(state) = channels.get_mut(&sample.channel) else {
            return;
        };
        let interval = i64::from(state.interval_secs);
        let start = sample.timestamp.unix_timestamp().div_euclid(interval) * interval;
        let window = state.windows.entry(start).or_default();
        match sample.value() {
            Some(v) => {
                window.values.push(v);
                window.sum += v;
                window.sum_sq += v * v;
            }
            None => window.invalid += 1,
        }
    }

    /// Removes and returns every window old enough to be complete.
    /// Windows without a single valid sample are dropped.
    pub fn ready(&self, now: OffsetDateTime) -> Vec<Aggregate> {
        let now_unix = now.unix_timestamp();
        let mut out = Vec::new();
        let mut channels = self.channels.lock();
        for (&channel, state) in channels.iter_mut() {
            let interval = i64::from(state.interval_secs);
            let expired: Vec<i64> = state
                .windows
                .keys()
                .copied()
                .take_while(|&start| start + interval + GRACE_SECS < now_unix)
                .collect();
            for start in expired {
                if let Some(window) = state.windows.remove(&start) {
                    out.extend(window.into_aggregate(channel, start, state.interval_secs));
                }
            }
        }
        out
    }

    /// Removes and returns everything, complete or not. Used on stop.
    pub fn flush(&self) -> Vec<Aggregate> {
        let mut out = Vec::new();
        let mut channels = self.channels.lock();
        for (&channel, state) in channels.iter_mut() {
            let windows = std::mem::take(&mut state.windows);
            for (start, window) in windows {
                out.extend(window.into_aggregate(channel, start, state.interval_secs));
            }
        }
        out
    }

    /// Open windows across all channels (diagnostics).
    pub fn open_windows(&self) -> usize {
        self.channels.lock().values().map(|s| s.windows.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample(channel: u16, raw: f64, at: OffsetDateTime) -> Sample {
        Sample::new(channel, raw, at)
    }

    fn aligned_t0() -> OffsetDateTime {
        // Multiple of 20 s since the epoch.
        datetime!(2024-05-01 10:00:00 UTC)
    }

    #[test]
    fn standard_window_aggregates() {
        let agg = WindowAggregator::for_channels([(0, false)]);
        let t0 = aligned_t0();
        agg.add_sample(&sample(0, 10.0, t0));
        agg.add_sample(&sample(0, 20.0, t0 + time::Duration::seconds(5)));
        agg.add_sample(&sample(0, -99.0, t0 + time::Duration::seconds(10)));
        agg.add_sample(&sample(0, 30.0, t0 + time::Duration::seconds(15)));
        let ready = agg.ready(t0 + time::Duration::seconds(23));
        assert_eq!(ready.len(), 1);
        let a = &ready[0];
        assert_eq!(a.sample_count, 3);
        assert_eq!(a.invalid_count, 1);
        assert_eq!(a.total_count(), 4);
        assert_eq!(a.min, 10.0);
        assert_eq!(a.max, 30.0);
        assert_eq!(a.avg, 20.0);
        assert_eq!(a.first, 10.0);
        assert_eq!(a.last, 30.0);
        // 1 of 4 readings invalid: over the 10% degradation threshold.
        assert_eq!(a.quality, QualityFlag::Degraded);
        assert_eq!(a.window_secs, 20);
        assert_eq!(a.window_end() - a.window_start, time::Duration::seconds(20));
    }

    #[test]
    fn window_not_ready_inside_grace() {
        let agg = WindowAggregator::for_channels([(0, false)]);
        let t0 = aligned_t0();
        agg.add_sample(&sample(0, 1.0, t0));
        assert!(agg.ready(t0 + time::Duration::seconds(22)).is_empty());
        assert_eq!(agg.ready(t0 + time::Duration::seconds(23)).len(), 1);
    }

    #[test]
    fn high_precision_uses_short_windows() {
        let agg = WindowAggregator::for_channels([(3, true)]);
        let t0 = aligned_t0();
        agg.add_sample(&sample(3, 5.0, t0));
        agg.add_sample(&sample(3, 7.0, t0 + time::Duration::seconds(11)));
        let ready = agg.ready(t0 + time::Duration::seconds(13));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].window_secs, 10);
        assert_eq!(ready[0].sample_count, 1);
        // The second sample sits in the next, still-open window.
        assert_eq!(agg.open_windows(), 1);
    }

    #[test]
    fn all_invalid_window_is_discarded() {
        let agg = WindowAggregator::for_channels([(0, false)]);
        let t0 = aligned_t0();
        agg.add_sample(&sample(0, -99.0, t0));
        agg.add_sample(&sample(0, -95.0, t0 + time::Duration::seconds(1)));
        assert!(agg.ready(t0 + time::Duration::seconds(30)).is_empty());
        assert_eq!(agg.open_windows(), 0);
    }

    #[test]
    fn nan_is_rejected_outright() {
        let agg = WindowAggregator::for_channels([(0, false)]);
        let t0 = aligned_t0();
        agg.add_sample(&sample(0, f64::NAN, t0));
        assert_eq!(agg.open_windows(), 0);
    }

    #[test]
    fn flush_returns_open_windows() {
        let agg = WindowAggregator::for_channels([(0, false), (1, true)]);
        let t0 = aligned_t0();
        agg.add_sample(&sample(0, 4.0, t0));
        agg.add_sample(&sample(1, 8.0, t0));
        let mut flushed = agg.flush();
        flushed.sort_by_key(|a| a.channel);
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].avg, 4.0);
        assert_eq!(flushed[1].avg, 8.0);
        assert_eq!(agg.open_windows(), 0);
    }

    #[test]
    fn quality_thresholds() {
        assert_eq!(QualityFlag::classify(0, 10), QualityFlag::Ok);
        assert_eq!(QualityFlag::classify(1, 10), QualityFlag::Ok);
        assert_eq!(QualityFlag::classify(2, 10), QualityFlag::Degraded);
        assert_eq!(QualityFlag::classify(5, 10), QualityFlag::Degraded);
        assert_eq!(QualityFlag::classify(6, 10), QualityFlag::Bad);
    }

    #[test]
    fn std_dev_of_constant_series_is_zero() {
        let agg = WindowAggregator::for_channels([(0, false)]);
        let t0 = aligned_t0();
        for i in 0..5 {
            agg.add_sample(&sample(0, 42.0, t0 + time::Duration::seconds(i)));
        }
        let ready = agg.ready(t0 + time::Duration::seconds(30));
        assert_eq!(ready[0].std_dev, Some(0.0));
    }
}
