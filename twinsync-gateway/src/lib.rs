//! The `twinsync-gateway` crate is the core of the twinsync edge
//! gateway: it bridges a fleet of local shop-floor devices (line-protocol
//! robots, tag-read PLCs) to a cloud MQTT broker.
//!
//! Remote users declare interest in device signals by publishing *plans*
//! on `twinsync/{tenant}/{gateway}/plan/...`. Per device, a session
//! unions all active user plans into one device-side subscription, polls
//! the device on a fixed tick, and emits frames upward. Frames are only
//! republished while at least one user holds a live lease; when the last
//! user leaves, publishing stops and the egress cache is dropped so a
//! stale frame can never reappear.
//!
//! The crate is composed of:
//! 1. A generic [`DeviceSession`] supervisor that owns the transport
//!    lifecycle: connect, one polling iteration per tick, fault
//!    classification, capped-backoff reconnect, graceful teardown.
//!    Concrete sessions ([`RobotSession`], [`PlcSession`]) implement the
//!    [`SessionHooks`] seam and layer plan-union semantics on top.
//! 2. The [`IngressRouter`], a single subscriber that parses topic
//!    triples into a [`DeviceKey`](twinsync_core::DeviceKey) and
//!    dispatches `plan`/`hb`/`leave` verbs to the owning session via the
//!    [`SessionRegistry`].
//! 3. The [`EgressPump`], a periodic publisher with a depth-1
//!    latest-wins cache per device, gated per device by user presence.
//! 4. The [`MqttLink`] facade over the broker connection, with a
//!    [`RumqttLink`] backend and an in-memory double for tests and
//!    simulation.
//! 5. The [`FleetRoster`] actor publishing the retained device roster
//!    document whenever membership or a status changes.
//!
//! # Examples
//! ```no_run
//! use twinsync_core::{GatewayScope, RobotConfig};
//! use twinsync_gateway::{EdgeGateway, GatewayOptions, MemoryLink, SimRobotConnector};
//!
//! #[actix::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = MemoryLink::new();
//!     let scope = GatewayScope::new("acme", "gw0");
//!     let gateway = EdgeGateway::start(scope, link, GatewayOptions::default()).await?;
//!
//!     let cfg = RobotConfig {
//!         name: "R1".into(),
//!         ip: "10.0.0.7".into(),
//!         port: 5020,
//!         device_type: "robot-fanuc".into(),
//!         connect_timeout_ms: 3_000,
//!         read_timeout_ms: 500,
//!         stream_period_ms: 30,
//!     };
//!     gateway
//!         .add_robot(cfg, Box::new(SimRobotConnector::default()))
//!         .await?;
//!     Ok(())
//! }
//! ```

mod egress;
mod gateway;
mod ingress;
mod mqtt;
mod registry;
mod roster;
mod session;
mod transport;

pub use egress::EgressPump;
pub use gateway::{EdgeGateway, GatewayError, GatewayOptions};
pub use ingress::IngressRouter;
pub use mqtt::{
    HandlerError, InboundMessage, MemoryLink, MessageHandler, MqttLink, MqttLinkError,
    PublishedRecord, QosLevel, RumqttLink,
};
pub use registry::SessionRegistry;
pub use roster::{DataSeen, FleetRoster, StatusUpdate, UpsertDevice};
pub use session::{
    DeviceSession, PlanTarget, PlcSession, PlcTuning, RobotSession, RobotTuning, SessionControl,
    SessionCore, SessionError, SessionEvent, SessionHooks, SessionTuning,
};
pub use transport::{
    PlcConnector, PlcTransport, RobotConnector, RobotTransport, SimPlcBank, SimPlcConnector,
    SimPlcTransport, SimRobotConnector, SimRobotDevice, TcpRobotConnector, TransportError,
};
