//! Outbound command packets.

use crate::error::{EngineError, Result};
use crate::types::PostId;

/// Global "start recording" command.
pub const START_RECORDING: [u8; 8] = [0x00, 0x00, 0x00, 0x04, 0x00, 0x15, 0x01, 0x01];
/// Global "stop recording" command.
pub const STOP_RECORDING: [u8; 8] = [0x00, 0x00, 0x00, 0x04, 0x00, 0x15, 0x00, 0x00];

/// Opaque dictionary announcement the remote expects once per
/// connection, immediately after connect. The content mirrors the
/// transmitter's fixed command table and is not interpreted here.
pub const PROTOCOL_BOOTSTRAP: &[u8] = &[
    0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x10, b'c',
    b'm', b'd', b'd', b'i', b'c', b't', 0x00, 0x00, 0x15, 0x01, 0x01, 0x00, 0x15, 0x00, 0x00,
    0x00, 0x10, b'D', b'O', b'0', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Fixed trailer byte per (relay index, state) pair.
fn relay_trailer(post: PostId, on: bool) -> u8 {
    match (post, on) {
        (PostId::A, true) => 0x0E,
        (PostId::A, false) => 0x0F,
        (PostId::B, true) => 0x0D,
        (PostId::B, false) => 0x0C,
        (PostId::C, true) => 0x0C,
        (PostId::C, false) => 0x0D,
    }
}

/// Builds the 20-byte relay-control packet switching a post's power.
pub fn relay_control(post: PostId, on: bool) -> [u8; 20] {
    let state = if on { 0x01 } else { 0x00 };
    [
        0x00,
        0x00,
        0x00,
        0x10,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x01,
        0x00,
        0x00,
        0x00,
        0x04,
        b'D',
        b'O',
        b'0',
        post.relay_digit(),
        state,
        relay_trailer(post, on),
    ]
}

/// Parses a relay packet back into (post, state); used by tests and the
/// command log.
pub fn parse_relay_control(packet: &[u8]) -> Result<(PostId, bool)> {
    if packet.len() != 20 || &packet[14..17] != b"DO0" {
        return Err(EngineError::Transport("not a relay packet".into()));
    }
    let post = match packet[17] {
        b'1' => PostId::A,
        b'2' => PostId::B,
        b'3' => PostId::C,
        other => {
            return Err(EngineError::Transport(format!(
                "unknown relay index {other:#04x}"
            )))
        }
    };
    let on = match packet[18] {
        0x00 => false,
        0x01 => true,
        other => {
            return Err(EngineError::Transport(format!(
                "unknown relay state {other:#04x}"
            )))
        }
    };
    if packet[19] != relay_trailer(post, on) {
        return Err(EngineError::Transport("relay trailer mismatch".into()));
    }
    Ok((post, on))
}
