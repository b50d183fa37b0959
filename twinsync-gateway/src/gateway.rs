//! Gateway assembly: builds the facade-side plumbing, owns the session
//! set, and runs the event loop that fans session events out to the
//! egress pump and the roster.

use actix::{Actor, Addr};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::egress::EgressPump;
use crate::ingress::IngressRouter;
use crate::mqtt::{MqttLink, MqttLinkError, QosLevel};
use crate::registry::SessionRegistry;
use crate::roster::{DataSeen, FleetRoster, StatusUpdate, UpsertDevice};
use crate::session::{
    DeviceSession, PlcSession, PlcTuning, RobotSession, RobotTuning, SessionControl, SessionCore,
    SessionError, SessionEvent, SessionTuning,
};
use crate::transport::{PlcConnector, RobotConnector};
use twinsync_core::{DeviceKey, GatewayScope, PlcConfig, RobotConfig};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("mqtt link error: {0}")]
    Link(#[from] MqttLinkError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Egress pump tick.
    pub publish_period: Duration,
    pub session_tuning: SessionTuning,
    pub robot_tuning: RobotTuning,
    pub plc_tuning: PlcTuning,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            publish_period: Duration::from_millis(30),
            session_tuning: SessionTuning::default(),
            robot_tuning: RobotTuning::default(),
            plc_tuning: PlcTuning::default(),
        }
    }
}

/// The assembled edge gateway. Owns the registry, the pump, the roster
/// actor and every device session.
pub struct EdgeGateway {
    scope: GatewayScope,
    link: Arc<dyn MqttLink>,
    registry: Arc<SessionRegistry>,
    pump: Arc<EgressPump>,
    roster: Addr<FleetRoster>,
    events_tx: UnboundedSender<SessionEvent>,
    event_loop: StdMutex<Option<JoinHandle<()>>>,
    sessions: StdMutex<Vec<Arc<dyn SessionControl>>>,
    options: GatewayOptions,
}

impl EdgeGateway {
    /// Wire the gateway: subscribe the ingress filters, attach the
    /// router, start the pump, the roster and the event loop.
    pub async fn start(
        scope: GatewayScope,
        link: Arc<dyn MqttLink>,
        options: GatewayOptions,
    ) -> Result<Arc<Self>, GatewayError> {
        for filter in scope.ingress_filters() {
            link.subscribe(&filter, QosLevel::AtLeastOnce).await?;
        }

        let registry = SessionRegistry::new();
        IngressRouter::new(scope.clone(), registry.clone()).attach(link.as_ref());

        let pump = EgressPump::start(link.clone(), options.publish_period);
        let roster = FleetRoster::new(scope.clone(), link.clone()).start();

        let (events_tx, events_rx) = unbounded_channel();
        let event_loop = tokio::spawn(event_loop(events_rx, pump.clone(), roster.clone()));

        Ok(Arc::new(Self {
            scope,
            link,
            registry,
            pump,
            roster,
            events_tx,
            event_loop: StdMutex::new(Some(event_loop)),
            sessions: StdMutex::new(Vec::new()),
            options,
        }))
    }

    pub fn scope(&self) -> &GatewayScope {
        &self.scope
    }

    pub fn link(&self) -> &Arc<dyn MqttLink> {
        &self.link
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Create, register and connect a robot session. First-connect
    /// errors propagate; the device is deregistered again on failure.
    pub async fn add_robot(
        &self,
        cfg: RobotConfig,
        connector: Box<dyn RobotConnector>,
    ) -> Result<DeviceKey, GatewayError> {
        let key = DeviceKey::new(
            &self.scope.tenant_id,
            &self.scope.gateway_id,
            &cfg.name,
            &cfg.device_type,
        );
        let core = SessionCore::new(key.clone(), self.events_tx.clone());
        let session = RobotSession::new(
            core.clone(),
            &cfg,
            connector,
            self.options.robot_tuning.clone(),
        );
        let supervisor = DeviceSession::new(
            core,
            session.clone(),
            self.options.session_tuning.clone(),
        );

        self.registry.register(session);
        self.roster.do_send(UpsertDevice {
            key: key.clone(),
            display_name: cfg.name.clone(),
            connection_type: "robot-line".into(),
        });

        if let Err(e) = supervisor.connect().await {
            self.registry.evict(&key);
            return Err(e.into());
        }
        self.sessions.lock().unwrap().push(supervisor);
        Ok(key)
    }

    /// Create, register and connect a PLC session.
    pub async fn add_plc(
        &self,
        cfg: PlcConfig,
        connector: Box<dyn PlcConnector>,
    ) -> Result<DeviceKey, GatewayError> {
        let key = DeviceKey::new(
            &self.scope.tenant_id,
            &self.scope.gateway_id,
            &cfg.name,
            &cfg.device_type,
        );
        let display_name = cfg.name.clone();
        let core = SessionCore::new(key.clone(), self.events_tx.clone());
        let session = PlcSession::new(core.clone(), cfg, connector, self.options.plc_tuning.clone());
        let supervisor = DeviceSession::new(
            core,
            session.clone(),
            self.options.session_tuning.clone(),
        );

        self.registry.register(session);
        self.roster.do_send(UpsertDevice {
            key: key.clone(),
            display_name,
            connection_type: "plc-tag".into(),
        });

        if let Err(e) = supervisor.connect().await {
            self.registry.evict(&key);
            return Err(e.into());
        }
        self.sessions.lock().unwrap().push(supervisor);
        Ok(key)
    }

    /// Disconnect every session, drain the pump, stop the loop.
    pub async fn shutdown(&self) {
        log::info!("gateway {}/{} shutting down", self.scope.tenant_id, self.scope.gateway_id);
        let sessions: Vec<Arc<dyn SessionControl>> =
            self.sessions.lock().unwrap().drain(..).collect();
        for session in sessions {
            session.disconnect().await;
        }
        for key in self.registry.keys() {
            self.registry.evict(&key);
        }
        self.pump.clear_all();
        self.pump.stop();
        if let Some(handle) = self.event_loop.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Fans session events out: frames to the pump (and the roster's
/// `last_data_ms`), statuses to the roster, gate flips to the pump.
/// One channel per gateway keeps per-session ordering intact, which is
/// what makes "disable then drop cache" race-free end to end.
async fn event_loop(
    mut events: UnboundedReceiver<SessionEvent>,
    pump: Arc<EgressPump>,
    roster: Addr<FleetRoster>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Frame { key, frame } => {
                roster.do_send(DataSeen {
                    key: key.clone(),
                    ts_ms: frame.ts(),
                });
                pump.enqueue(&key, frame);
            }
            SessionEvent::Status { key, status, error } => {
                if let Some(error) = error {
                    log::warn!("{key}: faulted: {error}");
                }
                roster.do_send(StatusUpdate { key, status });
            }
            SessionEvent::PublishAllowed { key, allowed } => {
                pump.set_publish_allowed(&key, allowed);
            }
        }
    }
    log::debug!("gateway event loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::MemoryLink;
    use crate::transport::{SimPlcBank, SimPlcConnector, SimRobotConnector, SimRobotDevice};

    fn options() -> GatewayOptions {
        GatewayOptions {
            publish_period: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn robot_cfg() -> RobotConfig {
        RobotConfig {
            name: "R1".into(),
            ip: "127.0.0.1".into(),
            port: 5020,
            device_type: "robot-fanuc".into(),
            connect_timeout_ms: 1_000,
            read_timeout_ms: 500,
            stream_period_ms: 10,
        }
    }

    async fn wait_for_frames(link: &MemoryLink, topic: &str) -> usize {
        for _ in 0..100 {
            let count = link.published_on(topic).len();
            if count > 0 {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        0
    }

    #[actix_rt::test]
    async fn start_subscribes_the_three_ingress_filters() {
        let link = MemoryLink::new();
        let gateway = EdgeGateway::start(
            GatewayScope::new("acme", "gw0"),
            link.clone(),
            options(),
        )
        .await
        .unwrap();
        assert_eq!(
            link.subscriptions(),
            vec![
                "twinsync/acme/gw0/plan/+/+/+".to_string(),
                "twinsync/acme/gw0/hb/+/+/+".to_string(),
                "twinsync/acme/gw0/leave/+/+/+".to_string(),
            ]
        );
        gateway.shutdown().await;
    }

    #[actix_rt::test]
    async fn plan_starts_frames_and_leave_stops_them() {
        let link = MemoryLink::new();
        let gateway = EdgeGateway::start(
            GatewayScope::new("acme", "gw0"),
            link.clone(),
            options(),
        )
        .await
        .unwrap();

        let device = SimRobotDevice::new();
        let key = gateway
            .add_robot(robot_cfg(), Box::new(SimRobotConnector::new(device)))
            .await
            .unwrap();
        let data_topic = key.data_topic();

        // no users yet: nothing flows
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(link.published_on(&data_topic).is_empty());

        link.inject(
            "twinsync/acme/gw0/plan/robot-fanuc/R1/userA",
            r#"{"di":[105],"gi":[1]}"#.as_bytes().to_vec(),
        )
        .await;
        assert!(wait_for_frames(&link, &data_topic).await > 0);

        link.inject(
            "twinsync/acme/gw0/leave/robot-fanuc/R1/userA",
            Vec::new(),
        )
        .await;
        // allow any in-flight tick to finish, then demand silence
        tokio::time::sleep(Duration::from_millis(40)).await;
        let after_leave = link.published_on(&data_topic).len();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            link.published_on(&data_topic).len(),
            after_leave,
            "frames must stop after the last user leaves"
        );

        gateway.shutdown().await;
    }

    #[actix_rt::test]
    async fn plc_plan_round_trips_through_the_pump() {
        let link = MemoryLink::new();
        let gateway = EdgeGateway::start(
            GatewayScope::new("acme", "gw0"),
            link.clone(),
            options(),
        )
        .await
        .unwrap();

        let cfg = PlcConfig {
            name: "plc1".into(),
            ip: "127.0.0.1".into(),
            port: 44818,
            slot: 0,
            plc_type: "controllogix".into(),
            path: "1,0".into(),
            device_type: "plc".into(),
            default_period_ms: 10,
            timeout_ms: 200,
            max_items: 50,
            max_array_elements: 8,
            max_struct_fields: 64,
        };
        let connector = SimPlcConnector::new(SimPlcBank::seeded(), &cfg);
        let key = gateway.add_plc(cfg, Box::new(connector)).await.unwrap();
        let data_topic = key.data_topic();

        link.inject(
            "twinsync/acme/gw0/plan/plc/plc1/userA",
            r#"{"kind":"machineData","items":[{"path":"Station1Status","expand":"udt"}]}"#
                .as_bytes()
                .to_vec(),
        )
        .await;
        assert!(wait_for_frames(&link, &data_topic).await > 0);

        let body: serde_json::Value =
            serde_json::from_slice(&link.published_on(&data_topic)[0].payload).unwrap();
        assert_eq!(body["deviceType"], "plc");
        assert_eq!(
            body["payload"]["values"]["Station1Status"]["k"],
            "struct"
        );
        assert_eq!(
            body["payload"]["values"]["Station1Status"]["v"]["Run"]["k"],
            "bool"
        );

        gateway.shutdown().await;
    }
}
