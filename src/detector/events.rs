//! Anomaly event model.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// What went wrong (or came back). Severity is fixed by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    MinViolation,
    MaxViolation,
    DeltaSpike,
    NoData,
    QualityDegraded,
    QualityBad,
    DataRestored,
    LimitsRestored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl AnomalyKind {
    pub fn severity(self) -> Severity {
        match self {
            AnomalyKind::MinViolation | AnomalyKind::MaxViolation | AnomalyKind::DeltaSpike => {
                Severity::Warning
            }
            AnomalyKind::QualityDegraded => Severity::Warning,
            AnomalyKind::NoData | AnomalyKind::QualityBad => Severity::Critical,
            AnomalyKind::DataRestored | AnomalyKind::LimitsRestored => Severity::Info,
        }
    }

    /// Whether the per-post anomaly counter includes this kind. Limit
    /// violations are operator warnings and the restore kinds are
    /// informational; neither bumps the counter.
    pub fn counts_as_anomaly(self) -> bool {
        matches!(
            self,
            AnomalyKind::NoData
                | AnomalyKind::DeltaSpike
                | AnomalyKind::QualityBad
                | AnomalyKind::QualityDegraded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::MinViolation => "MinViolation",
            AnomalyKind::MaxViolation => "MaxViolation",
            AnomalyKind::DeltaSpike => "DeltaSpike",
            AnomalyKind::NoData => "NoData",
            AnomalyKind::QualityDegraded => "QualityDegraded",
            AnomalyKind::QualityBad => "QualityBad",
            AnomalyKind::DataRestored => "DataRestored",
            AnomalyKind::LimitsRestored => "LimitsRestored",
        }
    }

    pub fn parse(s: &str) -> Option<AnomalyKind> {
        match s {
            "MinViolation" => Some(AnomalyKind::MinViolation),
            "MaxViolation" => Some(AnomalyKind::MaxViolation),
            "DeltaSpike" => Some(AnomalyKind::DeltaSpike),
            "NoData" => Some(AnomalyKind::NoData),
            "QualityDegraded" => Some(AnomalyKind::QualityDegraded),
            "QualityBad" => Some(AnomalyKind::QualityBad),
            "DataRestored" => Some(AnomalyKind::DataRestored),
            "LimitsRestored" => Some(AnomalyKind::LimitsRestored),
            _ => None,
        }
    }
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Critical => "Critical",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s {
            "Info" => Some(Severity::Info),
            "Warning" => Some(Severity::Warning),
            "Critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// A detected anomaly or restore, before persistence assigns it a row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub channel: u16,
    /// Display name snapshotted at detection time.
    pub channel_name: String,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub delta: Option<f64>,
    pub message: String,
    pub opened_at: OffsetDateTime,
    /// Set for instantaneous events; open violations carry `None` until
    /// their close.
    pub closed_at: Option<OffsetDateTime>,
}

impl AnomalyEvent {
    /// A sticky event that stays active until explicitly closed.
    pub fn open(
        channel: u16,
        channel_name: impl Into<String>,
        kind: AnomalyKind,
        message: impl Into<String>,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            channel,
            channel_name: channel_name.into(),
            kind,
            severity: kind.severity(),
            value: None,
            threshold: None,
            delta: None,
            message: message.into(),
            opened_at: at,
            closed_at: None,
        }
    }

    /// An instantaneous event (opened-at == closed-at).
    pub fn instant(
        channel: u16,
        channel_name: impl Into<String>,
        kind: AnomalyKind,
        message: impl Into<String>,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            closed_at: Some(at),
            ..Self::open(channel, channel_name, kind, message, at)
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn is_instant(&self) -> bool {
        self.closed_at == Some(self.opened_at)
    }
}

/// What a detector pass decided. `Close` targets the active sticky event
/// for the same (channel, kind).
#[derive(Debug, Clone)]
pub enum DetectorOutcome {
    Open(AnomalyEvent),
    Instant(AnomalyEvent),
    Close {
        channel: u16,
        kind: AnomalyKind,
        at: OffsetDateTime,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_is_fixed() {
        assert_eq!(AnomalyKind::MinViolation.severity(), Severity::Warning);
        assert_eq!(AnomalyKind::MaxViolation.severity(), Severity::Warning);
        assert_eq!(AnomalyKind::DeltaSpike.severity(), Severity::Warning);
        assert_eq!(AnomalyKind::QualityDegraded.severity(), Severity::Warning);
        assert_eq!(AnomalyKind::NoData.severity(), Severity::Critical);
        assert_eq!(AnomalyKind::QualityBad.severity(), Severity::Critical);
        assert_eq!(AnomalyKind::DataRestored.severity(), Severity::Info);
        assert_eq!(AnomalyKind::LimitsRestored.severity(), Severity::Info);
    }

    #[test]
    fn counter_excludes_limit_violations_and_restores() {
        assert!(!AnomalyKind::MinViolation.counts_as_anomaly());
        assert!(!AnomalyKind::MaxViolation.counts_as_anomaly());
        assert!(!AnomalyKind::DataRestored.counts_as_anomaly());
        assert!(!AnomalyKind::LimitsRestored.counts_as_anomaly());
        assert!(AnomalyKind::NoData.counts_as_anomaly());
        assert!(AnomalyKind::DeltaSpike.counts_as_anomaly());
        assert!(AnomalyKind::QualityBad.counts_as_anomaly());
        assert!(AnomalyKind::QualityDegraded.counts_as_anomaly());
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            AnomalyKind::MinViolation,
            AnomalyKind::MaxViolation,
            AnomalyKind::DeltaSpike,
            AnomalyKind::NoData,
            AnomalyKind::QualityDegraded,
            AnomalyKind::QualityBad,
            AnomalyKind::DataRestored,
            AnomalyKind::LimitsRestored,
        ] {
            assert_eq!(AnomalyKind::parse(kind.as_str()), Some(kind));
        }
    }
}
