//! Wire protocol: inbound frame decoding and outbound command packets.
//!
//! The acquisition source speaks big-endian binary. Two self-delimited
//! frame shapes coexist on one stream; see [`decoder::FrameDecoder`].

pub mod commands;
pub mod decoder;

use time::OffsetDateTime;

/// Readings at or below this value are the domain's "invalid" sentinel
/// (nominally -99). They travel the pipeline as not-a-number but are
/// persisted as the literal sentinel for legacy parity.
pub const SENTINEL_THRESHOLD: f64 = -90.0;

/// One decoded channel reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Registry channel index.
    pub channel: u16,
    /// Raw decoded value, sentinel included.
    pub raw: f64,
    /// Wall time at frame completion; shared by all samples of a frame.
    pub timestamp: OffsetDateTime,
}

impl Sample {
    pub fn new(channel: u16, raw: f64, timestamp: OffsetDateTime) -> Self {
        Self {
            channel,
            raw,
            timestamp,
        }
    }

    /// False for the sentinel and for non-finite decodes.
    pub fn is_valid(&self) -> bool {
        self.raw.is_finite() && self.raw > SENTINEL_THRESHOLD
    }

    /// The reading as a number, or `None` for an invalid reading.
    pub fn value(&self) -> Option<f64> {
        self.is_valid().then_some(self.raw)
    }
}
