use serde::{Deserialize, Serialize};

use crate::TOPIC_ROOT;

/// Tenant + gateway pair every topic in this process is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayScope {
    pub tenant_id: String,
    pub gateway_id: String,
}

impl GatewayScope {
    pub fn new(tenant_id: impl Into<String>, gateway_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            gateway_id: gateway_id.into(),
        }
    }

    /// Retained roster topic for this scope.
    pub fn devices_topic(&self) -> String {
        format!("{}/{}/{}/devices", TOPIC_ROOT, self.tenant_id, self.gateway_id)
    }

    /// The three ingress subscription filters (plan, hb, leave).
    pub fn ingress_filters(&self) -> [String; 3] {
        let verb = |v: &str| {
            format!(
                "{}/{}/{}/{}/+/+/+",
                TOPIC_ROOT, self.tenant_id, self.gateway_id, v
            )
        };
        [verb("plan"), verb("hb"), verb("leave")]
    }
}

/// Cloud broker endpoint. TLS material is PEM on disk; all three paths
/// must be present for a TLS session, otherwise the connection is
/// plaintext (bench/simulator use only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub ca_path: Option<String>,
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive_secs() -> u64 {
    30
}

/// Endpoint + pacing knobs for one line-protocol robot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotConfig {
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_robot_type")]
    pub device_type: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_stream_period_ms")]
    pub stream_period_ms: u64,
}

fn default_robot_type() -> String {
    "robot-fanuc".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_stream_period_ms() -> u64 {
    30
}

/// Endpoint + limits for one tag-read PLC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcConfig {
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub slot: u8,
    #[serde(default = "default_plc_type")]
    pub plc_type: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_plc_device_type")]
    pub device_type: String,
    #[serde(default = "default_plc_period_ms")]
    pub default_period_ms: u64,
    #[serde(default = "default_plc_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_max_array_elements")]
    pub max_array_elements: usize,
    #[serde(default = "default_max_struct_fields")]
    pub max_struct_fields: usize,
}

fn default_plc_type() -> String {
    "controllogix".to_string()
}

fn default_plc_device_type() -> String {
    "plc".to_string()
}

fn default_plc_period_ms() -> u64 {
    200
}

fn default_plc_timeout_ms() -> u64 {
    200
}

fn default_max_items() -> usize {
    50
}

fn default_max_array_elements() -> usize {
    64
}

fn default_max_struct_fields() -> usize {
    64
}
