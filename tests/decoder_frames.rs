#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::{legacy_frame, manual_clock, tagged_frame};
use frigorec::{ChannelRegistry, FrameDecoder, CHANNEL_COUNT};

fn decoder() -> FrameDecoder {
    FrameDecoder::new(Arc::new(ChannelRegistry::bootstrap().unwrap()), manual_clock())
}

/// The calibration frame: two channels, 12.5 and 99.0.
#[test]
fn legacy_two_channel_frame() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x24]);
    bytes.extend_from_slice(&[0x00; 20]);
    bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x02]);
    bytes.extend_from_slice(&[0x40, 0x29, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    bytes.extend_from_slice(&[0x40, 0x58, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00]);
    bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x24]);

    let mut dec = decoder();
    let samples = dec.feed(&bytes);
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].channel, 0);
    assert_eq!(samples[0].value(), Some(12.5));
    assert_eq!(samples[1].channel, 1);
    assert_eq!(samples[1].value(), Some(99.0));
    assert_eq!(samples[0].timestamp, samples[1].timestamp);
}

/// Sentinel readings surface as "not a number" but keep their raw value.
#[test]
fn legacy_frame_with_sentinel() {
    let mut dec = decoder();
    let samples = dec.feed(&legacy_frame(&[-99.0, 10.0]));
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].value(), None);
    assert_eq!(samples[0].raw, -99.0);
    assert_eq!(samples[1].value(), Some(10.0));
}

#[test]
fn zero_channel_frame_consumed_next_frame_parses() {
    let mut dec = decoder();
    let mut bytes = legacy_frame(&[]);
    bytes.extend_from_slice(&legacy_frame(&[7.0]));
    let samples = dec.feed(&bytes);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value(), Some(7.0));
}

#[test]
fn garbage_byte_then_tagged_frame_yields_permuted_samples() {
    let registry = Arc::new(ChannelRegistry::bootstrap().unwrap());
    let mut dec = FrameDecoder::new(Arc::clone(&registry), manual_clock());
    let mut values = [0.0f64; CHANNEL_COUNT];
    for (position, v) in values.iter_mut().enumerate() {
        *v = 1000.0 + position as f64;
    }
    let mut bytes = vec![0xA5u8];
    bytes.extend_from_slice(&tagged_frame(&values));

    let samples = dec.feed(&bytes);
    assert_eq!(samples.len(), CHANNEL_COUNT);
    // Registry permutation applied: the value at wire position p carries
    // registry index wire_map[p].
    for (position, sample) in samples.iter().enumerate() {
        assert_eq!(sample.channel, registry.wire_map()[position]);
        assert_eq!(sample.raw, 1000.0 + position as f64);
    }
    // Every registry index appears exactly once per frame.
    let mut seen = vec![false; CHANNEL_COUNT];
    for sample in &samples {
        assert!(!seen[sample.channel as usize]);
        seen[sample.channel as usize] = true;
    }
    assert!(seen.iter().all(|&s| s));
}

#[test]
fn mixed_shapes_on_one_stream() {
    let mut dec = decoder();
    let values = [2.0f64; CHANNEL_COUNT];
    let mut bytes = legacy_frame(&[1.0]);
    bytes.extend_from_slice(&tagged_frame(&values));
    bytes.extend_from_slice(&legacy_frame(&[3.0]));
    let samples = dec.feed(&bytes);
    assert_eq!(samples.len(), 1 + CHANNEL_COUNT + 1);
    assert_eq!(samples[0].value(), Some(1.0));
    assert_eq!(samples[samples.len() - 1].value(), Some(3.0));
}

#[test]
fn corrupt_length_resynchronises_on_next_frame() {
    let mut dec = decoder();
    let mut bad = legacy_frame(&[5.0, 6.0]);
    bad[3] ^= 0x01; // declared length no longer matches the trailer
    bad.extend_from_slice(&legacy_frame(&[8.0]));
    let samples = dec.feed(&bad);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value(), Some(8.0));
}

#[test]
fn truncated_tagged_frame_waits_for_completion() {
    let mut dec = decoder();
    let values = [4.0f64; CHANNEL_COUNT];
    let frame = tagged_frame(&values);
    assert!(dec.feed(&frame[..600]).is_empty());
    let samples = dec.feed(&frame[600..]);
    assert_eq!(samples.len(), CHANNEL_COUNT);
}

#[test]
fn reset_on_reconnect_discards_partial_frame() {
    let mut dec = decoder();
    let frame = legacy_frame(&[1.0, 2.0]);
    dec.feed(&frame[..frame.len() - 3]);
    dec.reset();
    // A fresh stream parses cleanly after the reset.
    let samples = dec.feed(&legacy_frame(&[9.0]));
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value(), Some(9.0));
}
