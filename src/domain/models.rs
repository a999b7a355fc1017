use serde::{Deserialize, Serialize};
use std::fmt;

/// Hardware address of a desk, in the `AA:BB:CC:DD:EE:FF` form BLE stacks print.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DeviceAddress(String);

impl From<String> for DeviceAddress {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().to_uppercase())
    }

    /// macOS reports all-zero addresses until a peripheral has been connected once.
    pub fn is_unresolved(&self) -> bool {
        self.0.is_empty() || self.0.chars().all(|c| c == '0' || c == ':')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

/// Events published by the discovery manager and the sessions it owns.
#[derive(Debug, Clone, PartialEq)]
pub enum DeskEvent {
    /// A peripheral advertising the desk control service was seen.
    Discovered(DeviceAddress),
    PositionChanged { position_cm: f64, speed: u16 },
    SessionReady(DeviceAddress),
    SessionLost(DeviceAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionLabel {
    Standing,
    Sitting,
}

impl PositionLabel {
    pub fn for_height(height_cm: f64, stand_threshold_cm: f64) -> Self {
        if height_cm >= stand_threshold_cm {
            Self::Standing
        } else {
            Self::Sitting
        }
    }
}

impl fmt::Display for PositionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standing => f.write_str("standing"),
            Self::Sitting => f.write_str("sitting"),
        }
    }
}

/// Reply body for a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeskStatus {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<PositionLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sitting_time: Option<u64>,
}

impl DeskStatus {
    pub fn not_ready() -> Self {
        Self {
            ready: false,
            height: None,
            pos: None,
            sitting_time: None,
        }
    }
}
