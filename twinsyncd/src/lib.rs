//! Headless daemon wrapping the twinsync gateway: loads the TOML
//! config, connects the broker link, adds the configured devices and
//! runs until interrupted.

pub mod config;

use thiserror::Error;

use twinsync_gateway::{GatewayError, MqttLinkError};

#[derive(Error, Debug)]
pub enum TwinSyncdError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Config Error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("Gateway Error")]
    Gateway(#[from] GatewayError),
    #[error("Mqtt Error")]
    Mqtt(#[from] MqttLinkError),
}

pub type TwinSyncdResult<T> = std::result::Result<T, TwinSyncdError>;
