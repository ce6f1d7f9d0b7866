#![allow(missing_docs)]

mod common;

use common::t0;
use frigorec::{QualityFlag, Sample, WindowAggregator};
use time::Duration;

fn sample(channel: u16, raw: f64, offset_secs: i64) -> Sample {
    Sample::new(channel, raw, t0() + Duration::seconds(offset_secs))
}

/// The canonical 20 s window: three valid readings, one sentinel.
#[test]
fn standard_window_with_sentinel() {
    let agg = WindowAggregator::for_channels([(0, false)]);
    agg.add_sample(&sample(0, 10.0, 0));
    agg.add_sample(&sample(0, 20.0, 5));
    agg.add_sample(&sample(0, -99.0, 10));
    agg.add_sample(&sample(0, 30.0, 15));

    let ready = agg.ready(t0() + Duration::seconds(23));
    assert_eq!(ready.len(), 1);
    let a = &ready[0];
    assert_eq!(a.channel, 0);
    assert_eq!(a.sample_count, 3);
    assert_eq!(a.invalid_count, 1);
    assert_eq!(a.total_count(), 4);
    assert_eq!(a.min, 10.0);
    assert_eq!(a.max, 30.0);
    assert_eq!(a.avg, 20.0);
    assert_eq!(a.first, 10.0);
    assert_eq!(a.last, 30.0);
    // 25% invalid readings: degraded, not bad.
    assert_eq!(a.quality, QualityFlag::Degraded);
    assert_eq!(a.window_start, t0());
    assert_eq!(a.window_end() - a.window_start, Duration::seconds(20));
}

/// sample_count + invalid_count always equals the total, and the window
/// geometry is fixed by the interval.
#[test]
fn count_and_geometry_invariants() {
    let agg = WindowAggregator::for_channels([(1, true)]);
    for i in 0..10 {
        let raw = if i % 3 == 0 { -99.0 } else { i as f64 };
        agg.add_sample(&sample(1, raw, i));
    }
    for a in agg.flush() {
        assert_eq!(a.sample_count + a.invalid_count, a.total_count());
        assert_eq!(
            a.window_end() - a.window_start,
            Duration::seconds(i64::from(a.window_secs))
        );
        assert_eq!(a.window_secs, 10);
    }
}

/// Samples landing after a window closes open the next one; nothing is
/// evicted by ingest itself.
#[test]
fn windows_tumble_on_the_epoch_grid() {
    let agg = WindowAggregator::for_channels([(0, false)]);
    agg.add_sample(&sample(0, 1.0, 0));
    agg.add_sample(&sample(0, 2.0, 19));
    agg.add_sample(&sample(0, 3.0, 20));
    assert_eq!(agg.open_windows(), 2);

    let ready = agg.ready(t0() + Duration::seconds(23));
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].sample_count, 2);
    assert_eq!(ready[0].last, 2.0);

    let rest = agg.flush();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].first, 3.0);
}

#[test]
fn ready_is_empty_until_grace_passes() {
    let agg = WindowAggregator::for_channels([(0, false)]);
    agg.add_sample(&sample(0, 5.0, 0));
    assert!(agg.ready(t0() + Duration::seconds(20)).is_empty());
    assert!(agg.ready(t0() + Duration::seconds(22)).is_empty());
    assert_eq!(agg.ready(t0() + Duration::seconds(23)).len(), 1);
}

#[test]
fn fully_invalid_windows_never_surface() {
    let agg = WindowAggregator::for_channels([(2, false)]);
    agg.add_sample(&sample(2, -99.0, 0));
    agg.add_sample(&sample(2, -91.0, 5));
    assert!(agg.ready(t0() + Duration::seconds(60)).is_empty());
    assert!(agg.flush().is_empty());
}

#[test]
fn majority_invalid_is_bad_quality() {
    let agg = WindowAggregator::for_channels([(0, false)]);
    agg.add_sample(&sample(0, 1.0, 0));
    agg.add_sample(&sample(0, -99.0, 1));
    agg.add_sample(&sample(0, -99.0, 2));
    let out = agg.flush();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].quality, QualityFlag::Bad);
    assert_eq!(out[0].quality.as_i8(), -1);
}

#[test]
fn std_dev_matches_the_series() {
    let agg = WindowAggregator::for_channels([(0, false)]);
    agg.add_sample(&sample(0, 2.0, 0));
    agg.add_sample(&sample(0, 4.0, 1));
    agg.add_sample(&sample(0, 4.0, 2));
    agg.add_sample(&sample(0, 4.0, 3));
    agg.add_sample(&sample(0, 5.0, 4));
    agg.add_sample(&sample(0, 5.0, 5));
    agg.add_sample(&sample(0, 7.0, 6));
    agg.add_sample(&sample(0, 9.0, 7));
    let out = agg.flush();
    // Known population standard deviation of 2.
    assert!((out[0].std_dev.unwrap() - 2.0).abs() < 1e-9);
}
