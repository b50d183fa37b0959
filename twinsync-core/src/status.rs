use serde::{Deserialize, Serialize};
use std::fmt;

/// Observable state of a device session.
///
/// The happy path is `Disconnected → Connecting → Connected →
/// Streaming`. `Faulted` is reached from any state on an unrecoverable
/// transport error and always transitions to `Disconnected` once
/// cleanup has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Faulted,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Connected => "connected",
            DeviceStatus::Streaming => "streaming",
            DeviceStatus::Faulted => "faulted",
        };
        f.write_str(s)
    }
}
