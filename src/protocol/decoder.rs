//! Resynchronising frame decoder.
//!
//! Input arrives as arbitrary byte chunks from the transport. Two frame
//! shapes coexist on the same stream:
//!
//! * a legacy length-prefixed shape whose channel indices are the value
//!   positions themselves, and
//! * a tagged 1132-byte record opened by an ASCII marker whose values are
//!   permuted into registry order via the catalogue wire map.
//!
//! Any integrity failure advances the scan by one byte and retries; a
//! truncated frame is retained until more bytes arrive. For any partition
//! of a valid byte stream into chunks, the concatenation of [`FrameDecoder::feed`]
//! outputs is identical.

use std::sync::Arc;

use tracing::trace;

use crate::clock::SharedClock;
use crate::registry::{ChannelRegistry, CHANNEL_COUNT};

use super::Sample;

/// ASCII marker opening (and repeated inside) a tagged frame.
pub const TAG_MARKER: &[u8; 13] = b"datiacquisiti";
/// Total size of a tagged frame on the wire.
pub const TAGGED_FRAME_LEN: usize = 1132;

/// Separator between the reserved block and the repeated marker.
pub const TAG_SEPARATOR: [u8; 2] = [0x00, 0x0D];
/// Count tag denoting 134 channels.
pub const TAG_COUNT: [u8; 8] = [0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x86];
const TAG_SECOND_MARKER_OFFSET: usize = 39;
const TAG_COUNT_OFFSET: usize = 52;
const TAG_VALUES_OFFSET: usize = 60;

/// Leading length word of a legacy frame covers the zero header plus the
/// value block.
const LEGACY_LEN_BASE: usize = 20;
/// Legacy frame overhead outside the declared length: the length word
/// itself, the count word and the trailer.
const LEGACY_EXTRA: usize = 12;

/// Resync buffer bound: twice the largest frame.
const RESYNC_CAP: usize = 2 * TAGGED_FRAME_LEN;

enum Parse {
    Frame { consumed: usize, samples: Vec<Sample> },
    Skip,
    Incomplete,
}

/// Incremental decoder over an append-only byte stream.
pub struct FrameDecoder {
    buf: Vec<u8>,
    registry: Arc<ChannelRegistry>,
    clock: SharedClock,
}

impl FrameDecoder {
    pub fn new(registry: Arc<ChannelRegistry>, clock: SharedClock) -> Self {
        Self {
            buf: Vec::with_capacity(RESYNC_CAP),
            registry,
            clock,
        }
    }

    /// Clears the resync buffer. Must be called on reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently held waiting for frame completion.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Appends a chunk and returns every sample completed by it, in wire
    /// order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Sample> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < self.buf.len() {
            match self.try_parse_at(pos) {
                Parse::Frame {
                    consumed,
                    mut samples,
                } => {
                    out.append(&mut samples);
                    pos += consumed;
                }
                Parse::Skip => pos += 1,
                Parse::Incomplete => break,
            }
        }
        self.buf.drain(..pos);
        if self.buf.len() > RESYNC_CAP {
            let excess = self.buf.len() - RESYNC_CAP;
            trace!(excess, "resync buffer over cap, dropping oldest bytes");
            self.buf.drain(..excess);
        }
        out
    }

    fn try_parse_at(&self, pos: usize) -> Parse {
        let b = &self.buf[pos..];
        if b[0] == TAG_MARKER[0] {
            self.try_parse_tagged(b)
        } else {
            self.try_parse_legacy(b)
        }
    }

    /// Expected structural byte of a tagged frame at offset `i`, or `None`
    /// where the shape is unconstrained (reserved bytes and values).
    fn tagged_structural(i: usize) -> Option<u8> {
        if i < TAG_MARKER.len() {
            Some(TAG_MARKER[i])
        } else if i < TAG_SECOND_MARKER_OFFSET - 2 {
            None
        } else if i < TAG_SECOND_MARKER_OFFSET {
            Some(TAG_SEPARATOR[i - (TAG_SECOND_MARKER_OFFSET - 2)])
        } else if i < TAG_COUNT_OFFSET {
            Some(TAG_MARKER[i - TAG_SECOND_MARKER_OFFSET])
        } else if i < TAG_VALUES_OFFSET {
            Some(TAG_COUNT[i - TAG_COUNT_OFFSET])
        } else {
            None
        }
    }

    fn try_parse_tagged(&self, b: &[u8]) -> Parse {
        let checkable = b.len().min(TAG_VALUES_OFFSET);
        for (i, &byte) in b[..checkable].iter().enumerate() {
            if let Some(expected) = Self::tagged_structural(i) {
                if byte != expected {
                    return Parse::Skip;
                }
            }
        }
        if b.len() < TAGGED_FRAME_LEN {
            return Parse::Incomplete;
        }
        let timestamp = self.clock.now();
        let wire = self.registry.wire_map();
        let mut samples = Vec::with_capacity(CHANNEL_COUNT);
        for position in 0..CHANNEL_COUNT {
            let raw = read_f64_be(b, TAG_VALUES_OFFSET + position * 8);
            samples.push(Sample::new(wire[position], raw, timestamp));
        }
        Parse::Frame {
            consumed: TAGGED_FRAME_LEN,
            samples,
        }
    }

    fn try_parse_legacy(&self, b: &[u8]) -> Parse {
        if b.len() < 4 {
            return Parse::Incomplete;
        }
        let declared = read_u32_be(b, 0) as usize;
        if declared < LEGACY_LEN_BASE
            || (declared - LEGACY_LEN_BASE) % 8 != 0
            || declared + LEGACY_EXTRA > RESYNC_CAP
        {
            return Parse::Skip;
        }
        let frame_len = declared + LEGACY_EXTRA;
        if b.len() < frame_len {
            return Parse::Incomplete;
        }
        let count = read_u32_be(b, 24) as usize;
        if declared != LEGACY_LEN_BASE + 8 * count {
            return Parse::Skip;
        }
        let trailer = read_u32_be(b, 28 + 8 * count) as usize;
        if trailer != declared {
            return Parse::Skip;
        }
        let timestamp = self.clock.now();
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            let raw = read_f64_be(b, 28 + 8 * i);
            // Legacy shape: channel index equals the value position.
            samples.push(Sample::new(i as u16, raw, timestamp));
        }
        Parse::Frame {
            consumed: frame_len,
            samples,
        }
    }
}

fn read_u32_be(b: &[u8], off: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&b[off..off + 4]);
    u32::from_be_bytes(word)
}

fn read_f64_be(b: &[u8], off: usize) -> f64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&b[off..off + 8]);
    f64::from_be_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    fn decoder() -> FrameDecoder {
        let registry = Arc::new(ChannelRegistry::bootstrap().unwrap());
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 08:00:00 UTC)));
        FrameDecoder::new(registry, clock)
    }

    /// Builds a legacy frame from raw values.
    fn legacy_frame(values: &[f64]) -> Vec<u8> {
        let declared = (LEGACY_LEN_BASE + 8 * values.len()) as u32;
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

    fn tagged_frame(values: &[f64; CHANNEL_COUNT]) -> Vec<u8> {
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

    #[test]
    fn legacy_frame_round_trips() {
        let mut dec = decoder();
        let samples = dec.feed(&legacy_frame(&[12.5, 99.0]));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].channel, 0);
        assert_eq!(samples[0].value(), Some(12.5));
        assert_eq!(samples[1].channel, 1);
        assert_eq!(samples[1].value(), Some(99.0));
        assert_eq!(samples[0].timestamp, samples[1].timestamp);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn zero_channel_frame_is_consumed() {
        let mut dec = decoder();
        let mut bytes = legacy_frame(&[]);
        bytes.extend_from_slice(&legacy_frame(&[1.0]));
        let samples = dec.feed(&bytes);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value(), Some(1.0));
    }

    #[test]
    fn corrupt_trailer_resyncs_to_next_frame() {
        let mut dec = decoder();
        let mut bad = legacy_frame(&[1.0]);
        let end = bad.len();
        bad[end - 1] ^= 0xFF;
        bad.extend_from_slice(&legacy_frame(&[2.0]));
        let samples = dec.feed(&bad);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value(), Some(2.0));
    }

    #[test]
    fn garbage_byte_before_tagged_frame() {
        let mut dec = decoder();
        let mut bytes = vec![0x7Fu8];
        let values = [21.0f64; CHANNEL_COUNT];
        bytes.extend_from_slice(&tagged_frame(&values));
        let samples = dec.feed(&bytes);
        assert_eq!(samples.len(), CHANNEL_COUNT);
    }

    #[test]
    fn tagged_values_follow_wire_permutation() {
        let registry = Arc::new(ChannelRegistry::bootstrap().unwrap());
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 08:00:00 UTC)));
        let mut dec = FrameDecoder::new(Arc::clone(&registry), clock);
        let mut values = [0.0f64; CHANNEL_COUNT];
        for (p, v) in values.iter_mut().enumerate() {
            *v = p as f64;
        }
        let samples = dec.feed(&tagged_frame(&values));
        // Value at wire position p lands on registry index wire_map[p].
        for (p, s) in samples.iter().enumerate() {
            assert_eq!(s.channel, registry.wire_map()[p]);
            assert_eq!(s.raw, p as f64);
        }
    }

    #[test]
    fn split_frame_is_retained_across_feeds() {
        let mut dec = decoder();
        let frame = legacy_frame(&[5.0, 6.0, 7.0]);
        let (head, tail) = frame.split_at(11);
        assert!(dec.feed(head).is_empty());
        assert!(dec.pending_len() > 0);
        let samples = dec.feed(tail);
        assert_eq!(samples.len(), 3);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut dec = decoder();
        let frame = legacy_frame(&[5.0]);
        dec.feed(&frame[..10]);
        dec.reset();
        assert_eq!(dec.pending_len(), 0);
        let samples = dec.feed(&frame);
        assert_eq!(samples.len(), 1);
    }
}
