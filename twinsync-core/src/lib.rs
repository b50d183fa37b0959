//! Shared data model for the twinsync edge gateway.
//!
//! This crate holds the types that cross crate boundaries in the
//! twinsync workspace: the routing [`DeviceKey`], the session
//! [`DeviceStatus`] machine states, the [`Frame`] sum type carried from
//! device sessions to the egress pump, the recursive [`PlcValue`] tag
//! union, the per-user plan types with their deterministic union
//! computation, and the JSON envelopes spoken on the MQTT wire.
//!
//! Everything here is plain data plus pure functions; the tasks, locks
//! and sockets that move these values around live in the
//! `twinsync-gateway` crate.

mod config;
mod envelope;
mod frame;
mod key;
mod plan;
mod status;
mod value;

pub use config::{GatewayScope, MqttConfig, PlcConfig, RobotConfig};
pub use envelope::{
    DataEnvelope, FramePayload, PlanEnvelope, PlanKind, RosterDocument, RosterEntry,
};
pub use frame::{Frame, PlcFrame, RegisterValue, TelemetryFrame};
pub use key::DeviceKey;
pub use plan::{MachineDataPlan, PlanItem, TelemetryPlan, MAX_TELEMETRY_FIELD, MIN_PERIOD_MS};
pub use status::DeviceStatus;
pub use value::PlcValue;

/// Root segment of every twinsync MQTT topic, ingress and egress.
pub const TOPIC_ROOT: &str = "twinsync";

/// Identifies a remote plan-publishing user within one gateway scope.
pub type UserId = String;
