//! Abstract device transports.
//!
//! Sessions never speak a concrete wire dialect; they drive one of the
//! trait objects below. The robot side is line-oriented (commands out,
//! response lines in); the PLC side is a batch tag read. Connectors
//! produce fresh transports so the supervisor can destroy and rebuild
//! the connection on every reconnect.

mod plc;
mod robot;

pub use plc::{SimPlcBank, SimPlcConnector, SimPlcTransport};
pub use robot::{SimRobotConnector, SimRobotDevice, TcpRobotConnector};

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use twinsync_core::{PlanItem, PlcValue};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("connection closed by peer")]
    Closed,
}

/// Line-oriented channel to one robot controller.
#[async_trait]
pub trait RobotTransport: Send {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError>;
    async fn read_line(&mut self) -> Result<String, TransportError>;
    /// Tear the connection down; failures are not reported, cleanup
    /// must be total.
    async fn close(&mut self);
}

/// Builds a fresh [`RobotTransport`] per (re)connect attempt.
#[async_trait]
pub trait RobotConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RobotTransport>, TransportError>;
}

/// Batch tag reader for one PLC.
///
/// The transport owns expansion: an item with `expand = "udt"` resolves
/// the tag's member list into a [`PlcValue::Struct`]; a path carrying an
/// `[a..b]` range reads each index and returns a [`PlcValue::Array`].
/// The returned map is keyed by each item's path exactly as requested.
#[async_trait]
pub trait PlcTransport: Send {
    async fn read(
        &mut self,
        items: &[PlanItem],
    ) -> Result<BTreeMap<String, PlcValue>, TransportError>;
    async fn close(&mut self);
}

/// Builds a fresh [`PlcTransport`] per (re)connect attempt.
#[async_trait]
pub trait PlcConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PlcTransport>, TransportError>;
}
