//! Frame codec for the iFit BLE wire format.
//!
//! Outbound commands and inbound telemetry share a 20-byte frame size. Some
//! commands are preceded by a 4-byte announce frame. Everything here is pure:
//! no I/O, no shared state.

use bytes::{Buf, BufMut, BytesMut};
use std::{fmt::Write as _, ops::RangeInclusive};
use thiserror::Error;

use crate::variant::DeviceVariant;

/// Frame size in bytes
pub const FRAME_SIZE: usize = 20;

/// Announce frame size in bytes
pub const ANNOUNCE_SIZE: usize = 4;

/// Announce frame written before every speed or incline command
pub const COMMAND_ANNOUNCE: [u8; ANNOUNCE_SIZE] = [0xfe, 0x02, 0x0d, 0x02];

/// Header every telemetry frame starts with
pub const TELEMETRY_HEADER: [u8; 4] = [0x00, 0x12, 0x01, 0x04];

/// Power readings above this are line noise, not effort
pub const MAX_PLAUSIBLE_POWER: u16 = 3000;

/// Settable speed range
pub const SPEED_RANGE: RangeInclusive<f64> = 0.0..=22.0;

/// Settable incline range in percent
pub const INCLINE_RANGE: RangeInclusive<f64> = 0.0..=15.0;

/// Command template header, bytes 0..=9
const COMMAND_PREFIX: [u8; 10] = [0xff, 0x0d, 0x02, 0x04, 0x02, 0x09, 0x04, 0x09, 0x02, 0x01];

/// Offset of the checksum byte in a command frame
pub const CHECKSUM_OFFSET: usize = 14;

/// Byte range covered by the command checksum
const CHECKSUM_SPAN: RangeInclusive<usize> = 6..=12;

/// Offset of the first byte of the all-0xFF sentinel region
const SENTINEL_OFFSET: usize = 12;

/// Target of a command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandTarget {
    /// Belt speed
    Speed = 0x01,
    /// Deck incline
    Incline = 0x02,
}

/// 4-byte frame that precedes a command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceFrame(pub [u8; ANNOUNCE_SIZE]);

impl AnnounceFrame {
    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// 20-byte speed or incline command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame(pub [u8; FRAME_SIZE]);

impl CommandFrame {
    /// Build a command frame for `target` carrying `value` as fixed-point hundredths
    #[must_use]
    pub fn new(target: CommandTarget, value: f64) -> Self {
        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        buf.put_slice(&COMMAND_PREFIX);
        buf.put_u8(target as u8);
        buf.put_u16_le(to_fixed_point(value));
        buf.put_bytes(0, FRAME_SIZE - buf.len());

        let mut frame = [0u8; FRAME_SIZE];
        frame.copy_from_slice(&buf);
        frame[CHECKSUM_OFFSET] = checksum(&frame);
        Self(frame)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded value, still in hundredths
    #[must_use]
    pub const fn raw_value(&self) -> u16 {
        u16::from_le_bytes([self.0[11], self.0[12]])
    }
}

/// Decoded, validated telemetry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryFrame {
    /// Belt speed in the console unit
    pub speed: f64,
    /// Incline in percent
    pub incline: f64,
    /// Power in watts
    pub power: u16,
}

impl TelemetryFrame {
    /// Whether the power reading can be trusted
    #[must_use]
    pub const fn is_power_plausible(&self) -> bool {
        self.power <= MAX_PLAUSIBLE_POWER
    }
}

/// Why an inbound frame was discarded
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Not a 20-byte frame
    #[error("wrong length: {len} bytes, expected {FRAME_SIZE}")]
    WrongLength {
        /// Received length
        len: usize,
    },
    /// Bytes 0..=3 are not the telemetry header
    #[error("bad telemetry header")]
    BadHeader,
    /// Bytes 4..=5 do not match the dialect
    #[error("telemetry header does not match the device variant")]
    VariantHeaderMismatch,
    /// Bytes 12..=19 are all 0xFF
    #[error("sentinel frame carries no data")]
    SentinelInvalid,
}

/// Encode a speed command
#[must_use]
pub fn encode_speed(value: f64) -> (AnnounceFrame, CommandFrame) {
    (
        AnnounceFrame(COMMAND_ANNOUNCE),
        CommandFrame::new(CommandTarget::Speed, value),
    )
}

/// Encode an incline command
#[must_use]
pub fn encode_incline(value: f64) -> (AnnounceFrame, CommandFrame) {
    (
        AnnounceFrame(COMMAND_ANNOUNCE),
        CommandFrame::new(CommandTarget::Incline, value),
    )
}

/// 8-bit wrapping sum of bytes 6..=12
#[must_use]
pub fn checksum(frame: &[u8; FRAME_SIZE]) -> u8 {
    frame[CHECKSUM_SPAN]
        .iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

/// Validate and decode a telemetry notification
///
/// # Errors
///
/// Returns the [`Rejection`] reason when the frame is not usable telemetry.
/// Checks run in order: length, header, variant header, sentinel.
pub fn decode(bytes: &[u8], variant: DeviceVariant) -> Result<TelemetryFrame, Rejection> {
    if bytes.len() != FRAME_SIZE {
        return Err(Rejection::WrongLength { len: bytes.len() });
    }

    if bytes[..4] != TELEMETRY_HEADER {
        return Err(Rejection::BadHeader);
    }

    if let Some(expected) = variant.header_check() {
        if bytes[4..6] != expected {
            return Err(Rejection::VariantHeaderMismatch);
        }
    }

    if bytes[SENTINEL_OFFSET..].iter().all(|b| *b == 0xFF) {
        return Err(Rejection::SentinelInvalid);
    }

    let mut buf = &bytes[10..];
    let speed = f64::from(buf.get_u16_le()) / 100.0;
    let incline = f64::from(buf.get_u16_le()) / 100.0;
    let power = buf.get_u16_le();

    Ok(TelemetryFrame {
        speed,
        incline,
        power,
    })
}

/// Space-separated lowercase hex, the format the wire trace uses
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_fixed_point(value: f64) -> u16 {
    // `as` saturates: negatives land on 0, overflow on u16::MAX
    (value * 100.0).round() as u16
}
