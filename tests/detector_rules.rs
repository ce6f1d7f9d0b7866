#![allow(missing_docs)]

mod common;

use common::t0;
use frigorec::{AnomalyDetector, AnomalyKind, ChannelRule, DetectorOutcome, Severity};
use time::Duration;

fn kinds(outcomes: &[DetectorOutcome]) -> Vec<AnomalyKind> {
    outcomes
        .iter()
        .map(|o| match o {
            DetectorOutcome::Open(e) | DetectorOutcome::Instant(e) => e.kind,
            DetectorOutcome::Close { kind, .. } => *kind,
        })
        .collect()
}

/// Min violation then recovery across the hysteresis band.
#[test]
fn min_violation_then_limits_restored() {
    let rule = ChannelRule::new(2, "PA.T02")
        .with_limits(Some(0.0), Some(10.0))
        .with_debounce(1);
    let det = AnomalyDetector::new(vec![rule], t0());

    let out = det.check_value(2, -1.0, t0());
    assert_eq!(kinds(&out), vec![AnomalyKind::MinViolation]);
    match &out[0] {
        DetectorOutcome::Open(e) => {
            assert_eq!(e.severity, Severity::Warning);
            assert_eq!(e.value, Some(-1.0));
            assert_eq!(e.threshold, Some(0.0));
            assert!(e.closed_at.is_none());
        }
        other => panic!("expected open, got {other:?}"),
    }

    let out = det.check_value(2, 5.0, t0() + Duration::seconds(1));
    assert_eq!(
        kinds(&out),
        vec![AnomalyKind::MinViolation, AnomalyKind::LimitsRestored]
    );
    assert!(matches!(out[0], DetectorOutcome::Close { .. }));
    match &out[1] {
        DetectorOutcome::Instant(e) => {
            assert_eq!(e.severity, Severity::Info);
            assert_eq!(e.closed_at, Some(e.opened_at));
        }
        other => panic!("expected instant restore, got {other:?}"),
    }
    assert_eq!(det.active_channels(), 0);
}

/// No-data timeout opens on the scan and closes on the next value, with
/// no duplicate from a scan in the same wall-second.
#[test]
fn no_data_then_restore() {
    let rule = ChannelRule::new(1, "PA.P02")
        .with_debounce(1)
        .with_no_data_timeout(Some(Duration::seconds(10)));
    let det = AnomalyDetector::new(vec![rule], t0());

    assert!(det.check_value(1, 25.0, t0()).is_empty());

    let out = det.check_timeouts(t0() + Duration::seconds(11));
    assert_eq!(kinds(&out), vec![AnomalyKind::NoData]);
    match &out[0] {
        DetectorOutcome::Open(e) => assert_eq!(e.severity, Severity::Critical),
        other => panic!("expected open, got {other:?}"),
    }

    let out = det.check_value(1, 25.1, t0() + Duration::seconds(12));
    assert_eq!(
        kinds(&out),
        vec![AnomalyKind::NoData, AnomalyKind::DataRestored]
    );

    assert!(det.check_timeouts(t0() + Duration::seconds(12)).is_empty());
}

/// At most one event per (channel, kind) is ever active.
#[test]
fn single_active_event_per_kind() {
    let rule = ChannelRule::new(3, "PB.T01")
        .with_limits(Some(0.0), None)
        .with_debounce(1);
    let det = AnomalyDetector::new(vec![rule], t0());

    let mut opens = 0;
    for i in 0..50 {
        let at = t0() + Duration::seconds(i);
        for outcome in det.check_value(3, -5.0 - i as f64, at) {
            if matches!(outcome, DetectorOutcome::Open(_)) {
                opens += 1;
            }
        }
    }
    assert_eq!(opens, 1);
    assert_eq!(det.active_channels(), 1);
}

/// Exactly min - hysteresis is not a violation; one epsilon below is.
#[test]
fn hysteresis_boundary() {
    let rule = ChannelRule::new(0, "PA.P01")
        .with_limits(Some(1.0), None)
        .with_hysteresis(0.25)
        .with_debounce(1);
    let det = AnomalyDetector::new(vec![rule], t0());
    assert!(det.check_value(0, 0.75, t0()).is_empty());
    let out = det.check_value(0, 0.75 - 1e-9, t0());
    assert_eq!(kinds(&out), vec![AnomalyKind::MinViolation]);
}

/// Debounce of one fires on the first crossing; default debounce needs
/// three consecutive crossings.
#[test]
fn debounce_counts_consecutive_crossings() {
    let rule = ChannelRule::new(4, "PC.T01").with_limits(None, Some(100.0));
    let det = AnomalyDetector::new(vec![rule], t0());
    assert!(det.check_value(4, 101.0, t0()).is_empty());
    // A sample back inside the band resets the streak.
    assert!(det.check_value(4, 99.0, t0()).is_empty());
    assert!(det.check_value(4, 101.0, t0()).is_empty());
    assert!(det.check_value(4, 102.0, t0()).is_empty());
    let out = det.check_value(4, 103.0, t0());
    assert_eq!(kinds(&out), vec![AnomalyKind::MaxViolation]);
}

#[test]
fn delta_spike_needs_a_previous_value() {
    let rule = ChannelRule::new(6, "PB.P03").with_max_delta(1.5);
    let det = AnomalyDetector::new(vec![rule], t0());
    assert!(det.check_value(6, 50.0, t0()).is_empty());
    let out = det.check_value(6, 52.0, t0() + Duration::seconds(1));
    assert_eq!(kinds(&out), vec![AnomalyKind::DeltaSpike]);
    match &out[0] {
        DetectorOutcome::Instant(e) => {
            assert_eq!(e.delta, Some(2.0));
            assert_eq!(e.threshold, Some(1.5));
        }
        other => panic!("expected instant, got {other:?}"),
    }
}
