#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::{legacy_frame, manual_clock, tagged_frame};
use frigorec::{ChannelRegistry, FrameDecoder, Sample, CHANNEL_COUNT};
use proptest::prelude::*;

fn decoder() -> FrameDecoder {
    FrameDecoder::new(Arc::new(ChannelRegistry::bootstrap().unwrap()), manual_clock())
}

fn collect(dec: &mut FrameDecoder, stream: &[u8], cuts: &[usize]) -> Vec<Sample> {
    let mut out = Vec::new();
    let mut begin = 0;
    for &cut in cuts {
        let cut = cut.min(stream.len());
        if cut > begin {
            out.extend(dec.feed(&stream[begin..cut]));
            begin = cut;
        }
    }
    out.extend(dec.feed(&stream[begin..]));
    out
}

fn arb_value() -> impl Strategy<Value = f64> {
    prop_oneof![
        -200.0..200.0f64,
        Just(-99.0),
        Just(0.0),
    ]
}

fn arb_stream() -> impl Strategy<Value = Vec<u8>> {
    let frame = prop_oneof![
        prop::collection::vec(arb_value(), 0..=8).prop_map(|vals| legacy_frame(&vals)),
        prop::collection::vec(arb_value(), CHANNEL_COUNT).prop_map(|vals| {
            let mut fixed = [0.0f64; CHANNEL_COUNT];
            fixed.copy_from_slice(&vals);
            tagged_frame(&fixed)
        }),
    ];
    prop::collection::vec(frame, 1..5).prop_map(|frames| frames.concat())
}

/// Long mixed stream cut at ChaCha-driven offsets; seeded so a failure
/// reproduces exactly.
#[test]
fn randomized_chunking_stress() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0x5EED);

    let mut stream = Vec::new();
    let mut expected_values = Vec::new();
    for i in 0..200 {
        if i % 7 == 0 {
            let mut vals = [0.0f64; CHANNEL_COUNT];
            for v in vals.iter_mut() {
                *v = rng.gen_range(-120.0..120.0);
            }
            expected_values.extend_from_slice(&vals);
            stream.extend_from_slice(&tagged_frame(&vals));
        } else {
            let count = rng.gen_range(0..6);
            let vals: Vec<f64> = (0..count).map(|_| rng.gen_range(-120.0..120.0)).collect();
            expected_values.extend_from_slice(&vals);
            stream.extend_from_slice(&legacy_frame(&vals));
        }
    }

    let mut dec = decoder();
    let mut samples = Vec::new();
    let mut offset = 0;
    while offset < stream.len() {
        let chunk = rng.gen_range(1..700).min(stream.len() - offset);
        samples.extend(dec.feed(&stream[offset..offset + chunk]));
        offset += chunk;
    }

    assert_eq!(samples.len(), expected_values.len());
    for (sample, expected) in samples.iter().zip(expected_values.iter()) {
        assert_eq!(sample.raw.to_bits(), expected.to_bits());
    }
}

proptest! {
    /// Feeding a valid stream in any chunking yields the same sample
    /// sequence as feeding it whole.
    #[test]
    fn partitioning_does_not_change_output(
        stream in arb_stream(),
        cuts in prop::collection::vec(0usize..6000, 0..12),
    ) {
        let mut sorted = cuts.clone();
        sorted.sort_unstable();

        let mut whole = decoder();
        let expected = whole.feed(&stream);

        let mut chunked = decoder();
        let actual = collect(&mut chunked, &stream, &sorted);

        prop_assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected.iter()) {
            prop_assert_eq!(a.channel, e.channel);
            // Sentinels decode to the same raw bits either way.
            prop_assert_eq!(a.raw.to_bits(), e.raw.to_bits());
        }
    }

    /// Garbage that can never open a frame (high bit set, so neither a
    /// marker byte nor a plausible length) is skipped byte by byte.
    #[test]
    fn garbage_prefix_is_skipped(
        prefix in prop::collection::vec(0x80u8..=0xFF, 0..64),
        vals in prop::collection::vec(-200.0..200.0f64, 1..5),
    ) {
        let mut dec = decoder();
        let mut stream = prefix.clone();
        stream.extend_from_slice(&legacy_frame(&vals));

        let samples = dec.feed(&stream);
        prop_assert_eq!(samples.len(), vals.len());
        for (i, sample) in samples.iter().enumerate() {
            prop_assert_eq!(sample.channel, i as u16);
            prop_assert_eq!(sample.raw, vals[i]);
        }
    }

    /// Every legacy frame of N channels yields exactly N indexed samples.
    #[test]
    fn legacy_frame_emits_dense_indices(vals in prop::collection::vec(arb_value(), 0..=16)) {
        let mut dec = decoder();
        let samples = dec.feed(&legacy_frame(&vals));
        prop_assert_eq!(samples.len(), vals.len());
        for (i, sample) in samples.iter().enumerate() {
            prop_assert_eq!(sample.channel, i as u16);
            let valid = vals[i].is_finite() && vals[i] > -90.0;
            prop_assert_eq!(sample.value().is_some(), valid);
        }
    }
}
