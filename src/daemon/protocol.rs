//! Line-framed JSON protocol spoken over the daemon socket.
//!
//! Each request and each response is one JSON value followed by `\n`.

use crate::domain::models::DeskStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    MoveTo { pos: f64 },
    Wait,
    GetStatus,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ack(bool),
    Status(DeskStatus),
}

/// Parse one line. Returns `None` for anything that is not JSON at all; JSON
/// that does not describe a known request becomes [`Request::Unknown`].
pub fn parse_line(line: &[u8]) -> Option<Request> {
    let value: serde_json::Value = serde_json::from_slice(line).ok()?;
    Some(serde_json::from_value(value).unwrap_or(Request::Unknown))
}

pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}
