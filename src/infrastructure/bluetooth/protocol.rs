//! Desk GATT Protocol
//!
//! Service identifiers, motor opcodes and the position payload layout of the
//! desk's linear actuator controller.

use crate::infrastructure::bluetooth::transport::BleError;
use uuid::Uuid;

/// Service carrying the position characteristic
pub const POSITION_SERVICE_UUID: Uuid = Uuid::from_u128(0x99fa0020_338a_1024_8a49_009c0215f78a);

/// Position characteristic - read and notify
pub const POSITION_CHAR_UUID: Uuid = Uuid::from_u128(0x99fa0021_338a_1024_8a49_009c0215f78a);

/// Control service, also the identifier the desk advertises
pub const CONTROL_SERVICE_UUID: Uuid = Uuid::from_u128(0x99fa0001_338a_1024_8a49_009c0215f78a);

/// Control characteristic - write without response
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x99fa0002_338a_1024_8a49_009c0215f78a);

/// Motor commands accepted by the control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeskCommand {
    Up,
    Down,
    Stop,
}

impl DeskCommand {
    /// Get the raw bytes for this command
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Up => &[0x47, 0x00],
            Self::Down => &[0x46, 0x00],
            Self::Stop => &[0xFF, 0x00],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        [Self::Up, Self::Down, Self::Stop]
            .into_iter()
            .find(|command| command.as_bytes() == bytes)
    }
}

/// Decoded position notification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFrame {
    pub position_cm: f64,
    pub speed: u16,
}

/// Parse a position payload
///
/// ```text
/// [0-1] : Position (i16 little-endian, hundredths of a centimeter)
/// [2-3] : Speed (u16 little-endian)
/// ```
pub fn decode_position(bytes: &[u8]) -> Result<PositionFrame, BleError> {
    let [p0, p1, s0, s1, ..] = bytes else {
        return Err(BleError::InvalidFrame(bytes.len()));
    };

    let raw_position = i16::from_le_bytes([*p0, *p1]);
    let speed = u16::from_le_bytes([*s0, *s1]);

    Ok(PositionFrame {
        position_cm: f64::from(raw_position) / 100.0,
        speed,
    })
}

/// Build a position payload, used by tests and the mock link.
#[cfg(test)]
pub fn encode_position(position_cm: f64, speed: u16) -> Vec<u8> {
    let raw = (position_cm * 100.0).round() as i16;
    let mut bytes = raw.to_le_bytes().to_vec();
    bytes.extend_from_slice(&speed.to_le_bytes());
    bytes
}
