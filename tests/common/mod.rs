#![allow(dead_code)]

use std::sync::Arc;

use frigorec::clock::ManualClock;
use frigorec::protocol::decoder::{TAG_COUNT, TAG_MARKER, TAG_SEPARATOR, TAGGED_FRAME_LEN};
use frigorec::CHANNEL_COUNT;
use time::macros::datetime;
use time::OffsetDateTime;

pub fn t0() -> OffsetDateTime {
    datetime!(2024-05-01 10:00:00 UTC)
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(t0()))
}

/// Builds a legacy length-prefixed frame around the given values.
pub fn legacy_frame(values: &[f64]) -> Vec<u8> {
    let declared = (20 + 8 * values.len()) as u32;
    let mut frame = Vec::new();
    frame.extend_from_slice(&declared.to_be_bytes());
    frame.extend_from_slice(&[0u8; 20]);
    frame.extend_from_slice(&(values.len() as u32).to_be_bytes());
    for v in values {
        frame.extend_from_slice(&v.to_be_bytes());
    }
    frame.extend_from_slice(&declared.to_be_bytes());
    frame
}

/// Builds a tagged 1132-byte frame carrying all 134 values.
pub fn tagged_frame(values: &[f64; CHANNEL_COUNT]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(TAGGED_FRAME_LEN);
    frame.extend_from_slice(TAG_MARKER);
    frame.extend_from_slice(&[0u8; 24]);
    frame.extend_from_slice(&TAG_SEPARATOR);
    frame.extend_from_slice(TAG_MARKER);
    frame.extend_from_slice(&TAG_COUNT);
    for v in values.iter() {
        frame.extend_from_slice(&v.to_be_bytes());
    }
    assert_eq!(frame.len(), TAGGED_FRAME_LEN);
    frame
}
