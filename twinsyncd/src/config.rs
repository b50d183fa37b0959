//! Daemon configuration: one TOML file naming the broker endpoint, the
//! tenant/gateway scope and the device fleet.
//!
//! The path comes from the `TWINSYNCD_CONFIG` environment variable and
//! falls back to `twinsyncd.toml` in the working directory.

use serde::Deserialize;
use std::path::Path;

use crate::TwinSyncdResult;
use twinsync_core::{GatewayScope, MqttConfig, PlcConfig, RobotConfig};

pub const CONFIG_ENV: &str = "TWINSYNCD_CONFIG";
pub const CONFIG_DEFAULT: &str = "twinsyncd.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub mqtt: MqttConfig,
    pub scope: GatewayScope,
    #[serde(default = "default_publish_period_ms")]
    pub publish_period_ms: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub robots: Vec<RobotConfig>,
    #[serde(default)]
    pub plcs: Vec<PlcConfig>,
}

fn default_publish_period_ms() -> u64 {
    30
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

impl DaemonConfig {
    pub fn load(path: impl AsRef<Path>) -> TwinSyncdResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Resolve the config path from the environment.
    pub fn path_from_env() -> String {
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| CONFIG_DEFAULT.to_string())
    }
}
