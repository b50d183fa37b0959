use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    DeviceStatus, Frame, MachineDataPlan, PlanItem, PlcValue, RegisterValue, TelemetryPlan,
};

/// Discriminator of the inbound plan envelope. Absent means telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanKind {
    #[default]
    #[serde(rename = "telemetry")]
    Telemetry,
    #[serde(rename = "machineData")]
    MachineData,
}

/// JSON body of a `plan` verb. Every array is optional on the wire;
/// a missing field is an empty field, never an error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanEnvelope {
    #[serde(default)]
    pub kind: PlanKind,
    #[serde(default)]
    pub di: Vec<u16>,
    #[serde(default)]
    pub gi: Vec<u16>,
    #[serde(default)]
    pub go: Vec<u16>,
    #[serde(default, rename = "do")]
    pub do_: Vec<u16>,
    #[serde(default)]
    pub r: Vec<u16>,
    #[serde(default)]
    pub var: Vec<String>,
    #[serde(default, rename = "periodMs")]
    pub period_ms: Option<u64>,
    #[serde(default)]
    pub items: Vec<PlanItem>,
}

impl PlanEnvelope {
    pub fn into_telemetry_plan(self) -> TelemetryPlan {
        TelemetryPlan {
            di: self.di,
            gi: self.gi,
            go: self.go,
            do_: self.do_,
            r: self.r,
            var: self.var,
            period_ms: self.period_ms,
        }
    }

    pub fn into_machine_data_plan(self) -> MachineDataPlan {
        MachineDataPlan {
            items: self.items,
            period_ms: self.period_ms,
        }
    }
}

/// Outbound data envelope published on the per-device data topic.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEnvelope<'a> {
    pub pub_seq: u64,
    pub ts: i64,
    pub frame_seq: u64,
    pub device_type: &'a str,
    pub device_id: &'a str,
    pub payload: FramePayload<'a>,
}

/// Frame body of the data envelope; one variant per frame kind.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FramePayload<'a> {
    Telemetry {
        #[serde(skip_serializing_if = "Option::is_none")]
        j: Option<&'a [f64; 6]>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        di: &'a BTreeMap<u16, i32>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        gi: &'a BTreeMap<u16, i32>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        go: &'a BTreeMap<u16, i32>,
        #[serde(rename = "do", skip_serializing_if = "BTreeMap::is_empty")]
        do_: &'a BTreeMap<u16, i32>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        r: &'a BTreeMap<u16, RegisterValue>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        v: &'a BTreeMap<String, String>,
    },
    Plc {
        values: &'a BTreeMap<String, PlcValue>,
    },
}

impl<'a> From<&'a Frame> for FramePayload<'a> {
    fn from(frame: &'a Frame) -> Self {
        match frame {
            Frame::Telemetry(f) => FramePayload::Telemetry {
                j: f.joints_deg.as_ref(),
                di: &f.di,
                gi: &f.gi,
                go: &f.go,
                do_: &f.do_,
                r: &f.r,
                v: &f.var,
            },
            Frame::Plc(f) => FramePayload::Plc { values: &f.values },
        }
    }
}

/// Retained roster document describing the fleet; remote UIs use it to
/// discover devices and their statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterDocument {
    pub ts: i64,
    pub tenant_id: String,
    pub gateway_id: String,
    pub devices: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub device_id: String,
    pub device_type: String,
    pub display_name: String,
    pub status: DeviceStatus,
    pub connection_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TelemetryFrame;

    #[test]
    fn plan_envelope_defaults_missing_fields_to_empty() {
        let env: PlanEnvelope = serde_json::from_str(r#"{"di":[105]}"#).unwrap();
        assert_eq!(env.kind, PlanKind::Telemetry);
        assert_eq!(env.di, vec![105]);
        assert!(env.var.is_empty() && env.r.is_empty() && env.items.is_empty());
        assert_eq!(env.period_ms, None);
    }

    #[test]
    fn plan_envelope_parses_machine_data_kind() {
        let env: PlanEnvelope = serde_json::from_str(
            r#"{"kind":"machineData","items":[{"path":"Station1Status","expand":"udt"}]}"#,
        )
        .unwrap();
        assert_eq!(env.kind, PlanKind::MachineData);
        let plan = env.into_machine_data_plan();
        assert_eq!(plan.items[0].expand.as_deref(), Some("udt"));
    }

    #[test]
    fn telemetry_payload_elides_empty_sections() {
        let mut frame = TelemetryFrame::default();
        frame.di.insert(105, 1);
        let frame = Frame::Telemetry(frame);
        let env = DataEnvelope {
            pub_seq: 3,
            ts: 1_700_000_000_000,
            frame_seq: 9,
            device_type: "robot-fanuc",
            device_id: "R1",
            payload: FramePayload::from(&frame),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["pubSeq"], 3);
        assert_eq!(json["frameSeq"], 9);
        assert_eq!(json["payload"]["di"]["105"], 1);
        assert!(json["payload"].get("gi").is_none());
        assert!(json["payload"].get("j").is_none());
    }

    #[test]
    fn plc_payload_keys_values_by_original_path() {
        let mut frame = crate::PlcFrame::default();
        frame
            .values
            .insert("Program:MainProgram.PartCount".into(), PlcValue::Int32(41));
        let frame = Frame::Plc(frame);
        let json = serde_json::to_value(FramePayload::from(&frame)).unwrap();
        assert_eq!(
            json["values"]["Program:MainProgram.PartCount"],
            serde_json::json!({"k": "int32", "v": 41})
        );
    }
}
