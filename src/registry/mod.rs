//! Static channel catalogue and the wire-position permutation.
//!
//! The test bench streams 134 channels. Their catalogue order (registry
//! index) groups channels by post; the wire protocol interleaves the
//! electrical blocks quantity-major at the tail of the frame. Both
//! orderings are expanded from the single [`BLOCKS`] table below, and
//! [`ChannelRegistry::bootstrap`] refuses to start the engine unless the
//! expansion yields dense, collision-free permutations on both sides.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::PostId;

/// Number of channels carried by the acquisition frame.
pub const CHANNEL_COUNT: usize = 134;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelGroup {
    PostA,
    PostB,
    PostC,
    Common,
    System,
}

impl ChannelGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelGroup::PostA => "PostA",
            ChannelGroup::PostB => "PostB",
            ChannelGroup::PostC => "PostC",
            ChannelGroup::Common => "Common",
            ChannelGroup::System => "System",
        }
    }

    pub fn parse(s: &str) -> Option<ChannelGroup> {
        match s {
            "PostA" => Some(ChannelGroup::PostA),
            "PostB" => Some(ChannelGroup::PostB),
            "PostC" => Some(ChannelGroup::PostC),
            "Common" => Some(ChannelGroup::Common),
            "System" => Some(ChannelGroup::System),
            _ => None,
        }
    }

    /// The post a group belongs to, if any.
    pub fn post(self) -> Option<PostId> {
        match self {
            ChannelGroup::PostA => Some(PostId::A),
            ChannelGroup::PostB => Some(PostId::B),
            ChannelGroup::PostC => Some(PostId::C),
            ChannelGroup::Common | ChannelGroup::System => None,
        }
    }
}

/// One immutable catalogue entry.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelDef {
    pub index: u16,
    pub name: String,
    pub unit: &'static str,
    pub group: ChannelGroup,
    pub min_limit: Option<f64>,
    pub max_limit: Option<f64>,
    pub high_precision: bool,
}

/// Declarative block of consecutive registry entries.
///
/// `wire_stride` covers the electrical tail of the frame, which the
/// protocol lays out quantity-major (currents for A, B, C, then voltages,
/// and so on) while the catalogue keeps each post's block contiguous.
struct Block {
    prefix: &'static str,
    count: u16,
    unit: &'static str,
    group: ChannelGroup,
    wire_base: u16,
    wire_stride: u16,
    min_limit: Option<f64>,
    max_limit: Option<f64>,
    high_precision: bool,
}

const fn block(
    prefix: &'static str,
    count: u16,
    unit: &'static str,
    group: ChannelGroup,
    wire_base: u16,
    wire_stride: u16,
    min_limit: Option<f64>,
    max_limit: Option<f64>,
    high_precision: bool,
) -> Block {
    Block {
        prefix,
        count,
        unit,
        group,
        wire_base,
        wire_stride,
        min_limit,
        max_limit,
        high_precision,
    }
}

use ChannelGroup::{Common, PostA, PostB, PostC, System};

/// The single source of truth for catalogue order and wire layout.
///
/// Wire frame: positions 0..47 are post A (pressures, humidity,
/// temperatures), 48..79 post B, 80..111 post C, 112..129 the three
/// electrical blocks quantity-major, 130..133 the shared bench channels.
const BLOCKS: &[Block] = &[
    // Post A: registry 0..53
    block("PA.P", 12, "bar", PostA, 0, 1, Some(0.0), Some(35.0), true),
    block("PA.UR", 4, "%", PostA, 12, 1, Some(0.0), Some(100.0), false),
    block("PA.T", 32, "degC", PostA, 16, 1, Some(-60.0), Some(150.0), false),
    block("PA.I", 1, "A", PostA, 112, 0, Some(0.0), Some(100.0), false),
    block("PA.U", 1, "V", PostA, 115, 0, Some(180.0), Some(260.0), false),
    block("PA.W", 1, "W", PostA, 118, 0, None, None, false),
    block("PA.WH", 1, "kWh", PostA, 121, 0, None, None, false),
    block("PA.COSFI", 1, "", PostA, 124, 0, Some(0.0), Some(1.0), false),
    block("PA.HZ", 1, "Hz", PostA, 127, 0, Some(45.0), Some(65.0), false),
    // Post B: registry 54..91
    block("PB.P", 8, "bar", PostB, 48, 1, Some(0.0), Some(35.0), true),
    block("PB.UR", 2, "%", PostB, 56, 1, Some(0.0), Some(100.0), false),
    block("PB.T", 22, "degC", PostB, 58, 1, Some(-60.0), Some(150.0), false),
    block("PB.I", 1, "A", PostB, 113, 0, Some(0.0), Some(100.0), false),
    block("PB.U", 1, "V", PostB, 116, 0, Some(180.0), Some(260.0), false),
    block("PB.W", 1, "W", PostB, 119, 0, None, None, false),
    block("PB.WH", 1, "kWh", PostB, 122, 0, None, None, false),
    block("PB.COSFI", 1, "", PostB, 125, 0, Some(0.0), Some(1.0), false),
    block("PB.HZ", 1, "Hz", PostB, 128, 0, Some(45.0), Some(65.0), false),
    // Post C: registry 92..129
    block("PC.P", 8, "bar", PostC, 80, 1, Some(0.0), Some(35.0), true),
    block("PC.UR", 2, "%", PostC, 88, 1, Some(0.0), Some(100.0), false),
    block("PC.T", 22, "degC", PostC, 90, 1, Some(-60.0), Some(150.0), false),
    block("PC.I", 1, "A", PostC, 114, 0, Some(0.0), Some(100.0), false),
    block("PC.U", 1, "V", PostC, 117, 0, Some(180.0), Some(260.0), false),
    block("PC.W", 1, "W", PostC, 120, 0, None, None, false),
    block("PC.WH", 1, "kWh", PostC, 123, 0, None, None, false),
    block("PC.COSFI", 1, "", PostC, 126, 0, Some(0.0), Some(1.0), false),
    block("PC.HZ", 1, "Hz", PostC, 129, 0, Some(45.0), Some(65.0), false),
    // Shared bench channels: registry 130..133
    block("AMB.T", 1, "degC", Common, 130, 0, Some(-10.0), Some(50.0), false),
    block("AMB.UR", 1, "%", Common, 131, 0, Some(0.0), Some(100.0), false),
    block("SYS.VDC", 1, "V", System, 132, 0, Some(20.0), Some(30.0), false),
    block("SYS.HB", 1, "", System, 133, 0, None, None, false),
];

/// Read-only catalogue, built once at startup.
#[derive(Debug)]
pub struct ChannelRegistry {
    defs: Vec<ChannelDef>,
    wire_to_index: Vec<u16>,
}

impl ChannelRegistry {
    /// Expands [`BLOCKS`] and verifies both permutations are dense.
    pub fn bootstrap() -> Result<Self> {
        let mut defs = Vec::with_capacity(CHANNEL_COUNT);
        let mut wire_to_index: Vec<Option<u16>> = vec![None; CHANNEL_COUNT];

        for blk in BLOCKS {
            for k in 0..blk.count {
                let index = defs.len() as u16;
                let name = if blk.count > 1 {
                    format!("{}{:02}", blk.prefix, k + 1)
                } else {
                    blk.prefix.to_string()
                };
                let position = blk.wire_base as usize + (blk.wire_stride as usize) * k as usize;
                let slot = wire_to_index.get_mut(position).ok_or_else(|| {
                    EngineError::Registry(format!(
                        "channel {name}: wire position {position} out of range"
                    ))
                })?;
                if let Some(prev) = slot {
                    return Err(EngineError::Registry(format!(
                        "wire position {position} claimed by both index {prev} and {index}"
                    )));
                }
                *slot = Some(index);
                defs.push(ChannelDef {
                    index,
                    name,
                    unit: blk.unit,
                    group: blk.group,
                    min_limit: blk.min_limit,
                    max_limit: blk.max_limit,
                    high_precision: blk.high_precision,
                });
            }
        }

        if defs.len() != CHANNEL_COUNT {
            return Err(EngineError::Registry(format!(
                "catalogue expands to {} channels, expected {CHANNEL_COUNT}",
                defs.len()
            )));
        }
        let wire_to_index = wire_to_index
            .into_iter()
            .enumerate()
            .map(|(pos, slot)| {
                slot.ok_or_else(|| {
                    EngineError::Registry(format!("wire position {pos} has no channel"))
                })
            })
            .collect::<Result<Vec<u16>>>()?;

        Ok(Self {
            defs,
            wire_to_index,
        })
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn get(&self, index: u16) -> Option<&ChannelDef> {
        self.defs.get(index as usize)
    }

    pub fn name(&self, index: u16) -> &str {
        self.get(index).map(|d| d.name.as_str()).unwrap_or("?")
    }

    /// Catalogue entries ordered by registry index.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelDef> {
        self.defs.iter()
    }

    /// Wire position -> registry index permutation used by the decoder.
    pub fn wire_map(&self) -> &[u16] {
        &self.wire_to_index
    }

    /// Registry indices a post records by default: its own group plus the
    /// Common channels, ordered by index.
    pub fn channels_for_post(&self, post: PostId) -> Vec<u16> {
        self.defs
            .iter()
            .filter(|d| d.group.post() == Some(post) || d.group == ChannelGroup::Common)
            .map(|d| d.index)
            .collect()
    }
}
