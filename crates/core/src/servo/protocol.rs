// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire encoding for the Maestro-family servo controllers.
//!
//! Both devices share one port, so every frame uses the multi-device variant:
//! `0xAA, device_number, command & 0x7F, data...`. Targets travel in
//! quarter-microsecond units; the public API stays in whole microseconds.

/// Multi-device frame lead-in byte.
pub const PROTOCOL_HEADER: u8 = 0xAA;

const CMD_SET_TARGET: u8 = 0x84;
const CMD_SET_SPEED: u8 = 0x87;
const CMD_SET_ACCELERATION: u8 = 0x89;
const CMD_GET_POSITION: u8 = 0x90;
const CMD_GET_ERRORS: u8 = 0xA1;
const CMD_STOP_SCRIPT: u8 = 0xA4;
const CMD_RUN_SUBROUTINE: u8 = 0xA7;

/// Reply length for position and error queries.
pub const REPLY_LEN_U16: usize = 2;

fn frame(device_number: u8, command: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + data.len());
    out.push(PROTOCOL_HEADER);
    out.push(device_number);
    out.push(command & 0x7F);
    out.extend_from_slice(data);
    out
}

/// Split a value into the protocol's 7-bit low/high pair.
fn split7(value: u16) -> [u8; 2] {
    [(value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
}

/// Set a channel target. `target_us` is whole microseconds; zero parks the
/// channel (no pulses).
pub fn set_target(device_number: u8, channel: u8, target_us: u16) -> Vec<u8> {
    let quarter_us = target_us.saturating_mul(4);
    let [lo, hi] = split7(quarter_us);
    frame(device_number, CMD_SET_TARGET, &[channel, lo, hi])
}

/// Set a channel's speed limit, 0 (unlimited) to 255.
pub fn set_speed(device_number: u8, channel: u8, speed: u8) -> Vec<u8> {
    let [lo, hi] = split7(speed as u16);
    frame(device_number, CMD_SET_SPEED, &[channel, lo, hi])
}

/// Set a channel's acceleration limit, 0 (unlimited) to 255.
pub fn set_acceleration(device_number: u8, channel: u8, accel: u8) -> Vec<u8> {
    let [lo, hi] = split7(accel as u16);
    frame(device_number, CMD_SET_ACCELERATION, &[channel, lo, hi])
}

/// Query a channel's current position. Expects a [`REPLY_LEN_U16`] reply.
pub fn get_position(device_number: u8, channel: u8) -> Vec<u8> {
    frame(device_number, CMD_GET_POSITION, &[channel])
}

/// Query and clear the device error register. Expects a [`REPLY_LEN_U16`] reply.
pub fn get_errors(device_number: u8) -> Vec<u8> {
    frame(device_number, CMD_GET_ERRORS, &[])
}

/// Stop the on-device script.
pub fn stop_script(device_number: u8) -> Vec<u8> {
    frame(device_number, CMD_STOP_SCRIPT, &[])
}

/// Restart the on-device script at a numbered subroutine.
pub fn run_subroutine(device_number: u8, subroutine: u8) -> Vec<u8> {
    frame(device_number, CMD_RUN_SUBROUTINE, &[subroutine])
}

/// Decode a two-byte little-endian reply (position in quarter-µs, or the
/// error bitfield).
pub fn decode_u16(reply: &[u8]) -> Option<u16> {
    match reply {
        [lo, hi] => Some(u16::from(*lo) | (u16::from(*hi) << 8)),
        _ => None,
    }
}

/// Convert a position reply from quarter-microseconds to microseconds.
pub fn quarter_us_to_us(quarter_us: u16) -> u16 {
    quarter_us / 4
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
