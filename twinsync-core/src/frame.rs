use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::PlcValue;

/// Integer + real view of one numeric robot register.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterValue {
    pub i: i32,
    pub r: f64,
}

/// One sampled snapshot from a robot's fast-streaming channel.
///
/// `seq` is per-session, starts at 1 and never decreases; `ts` is unix
/// milliseconds stamped when the frame was parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub ts: i64,
    pub seq: u64,
    pub joints_deg: Option<[f64; 6]>,
    pub di: BTreeMap<u16, i32>,
    pub gi: BTreeMap<u16, i32>,
    pub go: BTreeMap<u16, i32>,
    #[serde(rename = "do")]
    pub do_: BTreeMap<u16, i32>,
    pub r: BTreeMap<u16, RegisterValue>,
    pub var: BTreeMap<String, String>,
}

/// One batch read of a PLC tag union. `values` is keyed by the item
/// path exactly as the requesting user wrote it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlcFrame {
    pub ts: i64,
    pub seq: u64,
    pub values: BTreeMap<String, PlcValue>,
}

/// Sum of everything a device session can emit upward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Telemetry(TelemetryFrame),
    Plc(PlcFrame),
}

impl Frame {
    pub fn seq(&self) -> u64 {
        match self {
            Frame::Telemetry(f) => f.seq,
            Frame::Plc(f) => f.seq,
        }
    }

    pub fn ts(&self) -> i64 {
        match self {
            Frame::Telemetry(f) => f.ts,
            Frame::Plc(f) => f.ts,
        }
    }
}
