use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::plans::PlanBook;
use super::{PlanTarget, SessionCore, SessionError, SessionHooks};
use crate::transport::{PlcConnector, PlcTransport, TransportError};
use twinsync_core::{
    DeviceKey, Frame, MachineDataPlan, PlanItem, PlcConfig, PlcFrame, TelemetryPlan,
};

/// Lease/reaper knobs, same defaults as the robot side.
#[derive(Debug, Clone)]
pub struct PlcTuning {
    pub lease_timeout: Duration,
    pub reap_period: Duration,
    /// Sleep when the union is empty but users are present, so the
    /// session never issues spurious reads.
    pub empty_union_backoff: Duration,
}

impl Default for PlcTuning {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(60),
            reap_period: Duration::from_secs(5),
            empty_union_backoff: Duration::from_millis(50),
        }
    }
}

/// Machine-data session for one tag-read PLC.
///
/// Unions all users' `{path, expand}` items and reads the whole union in
/// one batch call per iteration, soft-pacing with the configured period.
/// Expansion (`udt` structs, `[a..b]` ranges) is the transport's job;
/// this session only presents the union list.
pub struct PlcSession {
    core: Arc<SessionCore>,
    cfg: PlcConfig,
    connector: Box<dyn PlcConnector>,
    plans: Mutex<PlanBook<MachineDataPlan>>,
    io: Mutex<Option<Box<dyn PlcTransport>>>,
    /// Current union, swapped wholesale on every plan mutation so the
    /// read loop never waits on the plan mutex.
    union_items: StdMutex<Arc<Vec<PlanItem>>>,
    period_ms: AtomicU64,
    empty_union_backoff: Duration,
    last_read: StdMutex<Option<Instant>>,
}

impl PlcSession {
    pub fn new(
        core: Arc<SessionCore>,
        cfg: PlcConfig,
        connector: Box<dyn PlcConnector>,
        tuning: PlcTuning,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            core,
            period_ms: AtomicU64::new(cfg.default_period_ms),
            empty_union_backoff: tuning.empty_union_backoff,
            cfg,
            connector,
            plans: Mutex::new(PlanBook::new(tuning.lease_timeout)),
            io: Mutex::new(None),
            union_items: StdMutex::new(Arc::new(Vec::new())),
            last_read: StdMutex::new(None),
        });
        session.spawn_reaper(tuning.reap_period);
        session
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    fn spawn_reaper(self: &Arc<Self>, period: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(session) = weak.upgrade() else { break };
                session.reap().await;
            }
        });
    }

    async fn reap(&self) {
        let reaped = self.plans.lock().await.reap();
        if !reaped.is_empty() {
            log::info!("{}: lease expired for users {:?}", self.core.key(), reaped);
            self.refresh().await;
        }
    }

    /// Re-derive the union item list, the pacing period and the gate.
    async fn refresh(&self) {
        let (has_users, union) = {
            let book = self.plans.lock().await;
            (
                book.has_users(),
                MachineDataPlan::union(book.plans(), self.cfg.max_items),
            )
        };
        self.period_ms.store(
            union.period_ms.unwrap_or(self.cfg.default_period_ms),
            Ordering::Relaxed,
        );
        *self.union_items.lock().unwrap() = Arc::new(union.items);
        self.core.set_publish_allowed(has_users);
    }

    /// Soft pace: hold off until one period has passed since the last
    /// completed read.
    async fn pace(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let period = Duration::from_millis(self.period_ms.load(Ordering::Relaxed));
        let deadline = self.last_read.lock().unwrap().map(|at| at + period);
        if let Some(deadline) = deadline {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Stopped),
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionHooks for PlcSession {
    async fn on_connect(&self) -> Result<(), SessionError> {
        let transport = self.connector.connect().await?;
        *self.io.lock().await = Some(transport);
        *self.last_read.lock().unwrap() = None;
        self.refresh().await;
        Ok(())
    }

    async fn on_disconnect(&self) {
        let mut io = self.io.lock().await;
        if let Some(mut transport) = io.take() {
            transport.close().await;
        }
    }

    async fn read_frame(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Frame>, SessionError> {
        let items = self.union_items.lock().unwrap().clone();
        if items.is_empty() {
            // Users are present but ask for nothing; idle instead of
            // issuing empty reads.
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Stopped),
                _ = tokio::time::sleep(self.empty_union_backoff) => return Ok(None),
            }
        }
        self.pace(cancel).await?;

        let bound = Duration::from_millis(self.cfg.timeout_ms.max(200));
        let values = {
            let mut io = self.io.lock().await;
            let transport = io.as_mut().ok_or(TransportError::Closed)?;
            match tokio::time::timeout(bound, transport.read(&items)).await {
                Ok(Ok(values)) => values,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if cancel.is_cancelled() => return Err(SessionError::Stopped),
                Err(_) => return Err(SessionError::ReadTimeout),
            }
        };
        *self.last_read.lock().unwrap() = Some(Instant::now());

        Ok(Some(Frame::Plc(PlcFrame {
            ts: chrono::Utc::now().timestamp_millis(),
            seq: self.core.next_seq(),
            values,
        })))
    }
}

#[async_trait]
impl PlanTarget for PlcSession {
    fn key(&self) -> &DeviceKey {
        self.core.key()
    }

    async fn apply_telemetry_plan(&self, user: &str, _plan: TelemetryPlan) {
        log::debug!(
            "{}: ignoring telemetry plan from {user} on a machine-data device",
            self.core.key()
        );
    }

    async fn apply_machine_data_plan(&self, user: &str, plan: MachineDataPlan) {
        log::debug!("{}: plan from {user}: {plan:?}", self.core.key());
        self.plans.lock().await.apply(user, plan);
        self.refresh().await;
    }

    async fn touch_user(&self, user: &str) {
        if !self.plans.lock().await.touch(user) {
            log::debug!("{}: heartbeat from unknown user {user}", self.core.key());
        }
    }

    async fn remove_user(&self, user: &str) {
        if self.plans.lock().await.remove(user) {
            log::info!("{}: user {user} left", self.core.key());
            self.refresh().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DeviceSession, SessionEvent, SessionTuning};
    use crate::transport::{SimPlcBank, SimPlcConnector};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use twinsync_core::PlcValue;

    fn plc_cfg() -> PlcConfig {
        PlcConfig {
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
        }
    }

    struct Rig {
        session: Arc<PlcSession>,
        supervisor: Arc<DeviceSession<PlcSession>>,
        events: UnboundedReceiver<SessionEvent>,
    }

    fn rig() -> Rig {
        let (tx, events) = unbounded_channel();
        let cfg = plc_cfg();
        let core = SessionCore::new(DeviceKey::new("acme", "gw0", "plc1", "plc"), tx);
        let connector = SimPlcConnector::new(SimPlcBank::seeded(), &cfg);
        let session = PlcSession::new(core.clone(), cfg, Box::new(connector), PlcTuning::default());
        let supervisor = DeviceSession::new(core, session.clone(), SessionTuning::default());
        Rig {
            session,
            supervisor,
            events,
        }
    }

    async fn next_plc_frame(events: &mut UnboundedReceiver<SessionEvent>) -> PlcFrame {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(SessionEvent::Frame {
                    frame: Frame::Plc(frame),
                    ..
                })) => return frame,
                Ok(Some(_)) => continue,
                other => panic!("no frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn udt_item_reads_expanded_struct() {
        let mut rig = rig();
        rig.supervisor.connect().await.unwrap();
        rig.session
            .apply_machine_data_plan(
                "userA",
                MachineDataPlan {
                    items: vec![PlanItem::expanded("Station1Status", "udt")],
                    period_ms: None,
                },
            )
            .await;

        let frame = next_plc_frame(&mut rig.events).await;
        match &frame.values["Station1Status"] {
            PlcValue::Struct(members) => {
                for name in ["Run", "Faulted", "FaultCode", "Speed", "Temp0", "Temp1"] {
                    assert!(members.contains_key(name), "missing member {name}");
                }
            }
            other => panic!("expected struct, got {other:?}"),
        }

        rig.supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn empty_union_with_users_emits_nothing() {
        let mut rig = rig();
        rig.supervisor.connect().await.unwrap();
        rig.session
            .apply_machine_data_plan("userA", MachineDataPlan::default())
            .await;
        assert!(rig.session.core().publish_allowed());

        let got = tokio::time::timeout(Duration::from_millis(150), async {
            loop {
                match rig.events.recv().await {
                    Some(SessionEvent::Frame { .. }) => return true,
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await;
        assert!(got.is_err(), "idle session must not emit frames");

        rig.supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn values_are_keyed_by_original_path() {
        let mut rig = rig();
        rig.supervisor.connect().await.unwrap();
        rig.session
            .apply_machine_data_plan(
                "userA",
                MachineDataPlan {
                    items: vec![
                        PlanItem::new("Program:MainProgram.PartCount"),
                        PlanItem::new("Line.Temps[0..3]"),
                    ],
                    period_ms: None,
                },
            )
            .await;

        let frame = next_plc_frame(&mut rig.events).await;
        assert!(matches!(
            frame.values["Program:MainProgram.PartCount"],
            PlcValue::Int32(_)
        ));
        match &frame.values["Line.Temps[0..3]"] {
            PlcValue::Array(elems) => assert_eq!(elems.len(), 4),
            other => panic!("expected array, got {other:?}"),
        }

        rig.supervisor.disconnect().await;
    }
}
