use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::plans::PlanBook;
use super::{PlanTarget, SessionCore, SessionError, SessionHooks};
use crate::transport::{RobotConnector, RobotTransport};
use twinsync_core::{
    DeviceKey, Frame, MachineDataPlan, RegisterValue, RobotConfig, TelemetryFrame, TelemetryPlan,
};

/// Lease/reaper knobs; the defaults match production (60 s lease,
/// 5 s reap tick).
#[derive(Debug, Clone)]
pub struct RobotTuning {
    pub lease_timeout: Duration,
    pub reap_period: Duration,
}

impl Default for RobotTuning {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(60),
            reap_period: Duration::from_secs(5),
        }
    }
}

struct RobotIo {
    transport: Option<Box<dyn RobotTransport>>,
    /// What the device currently streams; reset to empty on every fresh
    /// connection because the controller forgets its plan.
    applied: TelemetryPlan,
}

/// Telemetry session for one line-protocol robot.
///
/// Keeps the per-user plan book, computes the deterministic union, and
/// re-applies it to the device only on change (`PLAN_*` commands, each
/// acked with a literal `OK`). The streaming iteration sends `GET_FAST`
/// and parses the response up to the `END` sentinel under a fixed-period
/// pace. User presence drives the `publish_allowed` gate.
pub struct RobotSession {
    core: Arc<SessionCore>,
    connector: Box<dyn RobotConnector>,
    plans: Mutex<PlanBook<TelemetryPlan>>,
    /// Plan application and stream reads contend on this one lock so
    /// half-sent commands cannot interleave on the transport.
    io: Mutex<RobotIo>,
    period_ms: AtomicU64,
    default_period_ms: u64,
    read_timeout: Duration,
    next_tick: StdMutex<Option<Instant>>,
}

impl RobotSession {
    pub fn new(
        core: Arc<SessionCore>,
        cfg: &RobotConfig,
        connector: Box<dyn RobotConnector>,
        tuning: RobotTuning,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            core,
            connector,
            plans: Mutex::new(PlanBook::new(tuning.lease_timeout)),
            io: Mutex::new(RobotIo {
                transport: None,
                applied: TelemetryPlan::default(),
            }),
            period_ms: AtomicU64::new(cfg.stream_period_ms),
            default_period_ms: cfg.stream_period_ms,
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
            next_tick: StdMutex::new(None),
        });
        session.spawn_reaper(tuning.reap_period);
        session
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// Background lease reaper; lives as long as the session itself.
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

    fn current_union(book: &PlanBook<TelemetryPlan>) -> TelemetryPlan {
        TelemetryPlan::union(book.plans())
    }

    /// Re-derive everything that hangs off the plan book: the effective
    /// streaming period, the demand gate, and the device-side plan.
    async fn refresh(&self) {
        let (has_users, union) = {
            let book = self.plans.lock().await;
            (book.has_users(), Self::current_union(&book))
        };
        self.period_ms.store(
            union.period_ms.unwrap_or(self.default_period_ms),
            Ordering::Relaxed,
        );
        self.core.set_publish_allowed(has_users);
        if let Err(e) = self.apply_if_changed(&union).await {
            // The transport has been dropped; the run loop will fault on
            // its next read and the reconnect path re-applies the union.
            log::warn!("{}: plan application failed: {e}", self.core.key());
        }
    }

    /// Send the union to the device iff it differs from what the device
    /// already streams. On failure the transport is torn down so the
    /// supervisor classifies it as connection loss.
    async fn apply_if_changed(&self, union: &TelemetryPlan) -> Result<(), SessionError> {
        let mut io = self.io.lock().await;
        let io = &mut *io;
        let Some(transport) = io.transport.as_mut() else {
            // Not connected yet; on_connect applies the union.
            return Ok(());
        };
        if io.applied == *union {
            return Ok(());
        }
        match send_plan(transport.as_mut(), union).await {
            Ok(()) => {
                log::debug!("{}: plan applied: {:?}", self.core.key(), union);
                io.applied = union.clone();
                Ok(())
            }
            Err(e) => {
                transport.close().await;
                io.transport = None;
                Err(e)
            }
        }
    }

    /// Fixed-period pace; on drift the schedule collapses back to now
    /// instead of bursting to catch up.
    async fn pace(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let period = Duration::from_millis(self.period_ms.load(Ordering::Relaxed));
        let deadline = {
            let mut next = self.next_tick.lock().unwrap();
            let now = Instant::now();
            let deadline = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(deadline + period);
            deadline
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Stopped),
            _ = tokio::time::sleep_until(deadline) => Ok(()),
        }
    }
}

#[async_trait]
impl SessionHooks for RobotSession {
    async fn on_connect(&self) -> Result<(), SessionError> {
        let transport = self.connector.connect().await?;
        {
            let mut io = self.io.lock().await;
            io.transport = Some(transport);
            io.applied = TelemetryPlan::default();
        }
        *self.next_tick.lock().unwrap() = None;

        // Re-apply the full current union before the first read.
        let (has_users, union) = {
            let book = self.plans.lock().await;
            (book.has_users(), Self::current_union(&book))
        };
        self.period_ms.store(
            union.period_ms.unwrap_or(self.default_period_ms),
            Ordering::Relaxed,
        );
        self.apply_if_changed(&union).await?;
        self.core.set_publish_allowed(has_users);
        Ok(())
    }

    async fn on_disconnect(&self) {
        let mut io = self.io.lock().await;
        if let Some(mut transport) = io.transport.take() {
            transport.close().await;
        }
        io.applied = TelemetryPlan::default();
    }

    async fn read_frame(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Frame>, SessionError> {
        self.pace(cancel).await?;

        let lines = {
            let mut io = self.io.lock().await;
            let transport = io
                .transport
                .as_mut()
                .ok_or(crate::transport::TransportError::Closed)?;
            transport.send_line("GET_FAST").await?;
            match tokio::time::timeout(self.read_timeout, read_until_end(transport.as_mut()))
                .await
            {
                Ok(Ok(lines)) => lines,
                Ok(Err(e)) => return Err(e.into()),
                // A lapsed deadline with a live parent token is
                // connection loss, not cancellation.
                Err(_) if cancel.is_cancelled() => return Err(SessionError::Stopped),
                Err(_) => return Err(SessionError::ReadTimeout),
            }
        };

        let mut frame = parse_fast_frame(&lines)?;
        frame.seq = self.core.next_seq();
        frame.ts = chrono::Utc::now().timestamp_millis();
        Ok(Some(Frame::Telemetry(frame)))
    }
}

#[async_trait]
impl PlanTarget for RobotSession {
    fn key(&self) -> &DeviceKey {
        self.core.key()
    }

    async fn apply_telemetry_plan(&self, user: &str, plan: TelemetryPlan) {
        log::debug!("{}: plan from {user}: {plan:?}", self.core.key());
        self.plans.lock().await.apply(user, plan);
        self.refresh().await;
    }

    async fn apply_machine_data_plan(&self, user: &str, _plan: MachineDataPlan) {
        log::debug!(
            "{}: ignoring machine-data plan from {user} on a telemetry device",
            self.core.key()
        );
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

/// Push the full plan to the device, one `PLAN_<FIELD>=` command per
/// field, each expecting a literal `OK` line back.
async fn send_plan(
    transport: &mut dyn RobotTransport,
    plan: &TelemetryPlan,
) -> Result<(), SessionError> {
    let csv = |v: &[u16]| {
        v.iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",")
    };
    let commands = [
        format!("PLAN_DI={}", csv(&plan.di)),
        format!("PLAN_GI={}", csv(&plan.gi)),
        format!("PLAN_GO={}", csv(&plan.go)),
        format!("PLAN_DO={}", csv(&plan.do_)),
        format!("PLAN_R={}", csv(&plan.r)),
        format!("PLAN_VAR={}", plan.var.join(",")),
    ];
    for command in &commands {
        transport.send_line(command).await?;
        let reply = transport.read_line().await?;
        if reply.trim() != "OK" {
            return Err(SessionError::Protocol(format!(
                "device answered {reply:?} to {command:?}"
            )));
        }
    }
    Ok(())
}

async fn read_until_end(
    transport: &mut dyn RobotTransport,
) -> Result<Vec<String>, crate::transport::TransportError> {
    let mut lines = Vec::new();
    loop {
        let line = transport.read_line().await?;
        if line.trim() == "END" {
            return Ok(lines);
        }
        lines.push(line);
    }
}

/// Parse one `GET_FAST` response. Unknown prefixes are ignored;
/// malformed content under a known prefix is a device protocol fault.
fn parse_fast_frame(lines: &[String]) -> Result<TelemetryFrame, SessionError> {
    let mut frame = TelemetryFrame::default();
    for line in lines {
        let Some((prefix, rest)) = line.split_once('=') else {
            continue;
        };
        match prefix {
            "J" => frame.joints_deg = Some(parse_joints(line, rest)?),
            "DI" => frame.di = parse_int_map(line, rest)?,
            "GI" => frame.gi = parse_int_map(line, rest)?,
            "GO" => frame.go = parse_int_map(line, rest)?,
            "DO" => frame.do_ = parse_int_map(line, rest)?,
            "R" => frame.r = parse_register_map(line, rest)?,
            "VAR" => frame.var = parse_var_map(line, rest)?,
            _ => {}
        }
    }
    Ok(frame)
}

fn malformed(line: &str) -> SessionError {
    SessionError::MalformedFrame(line.to_string())
}

fn parse_joints(line: &str, rest: &str) -> Result<[f64; 6], SessionError> {
    let mut joints = [0.0; 6];
    let mut count = 0;
    for (slot, part) in joints.iter_mut().zip(rest.split(',')) {
        *slot = part.trim().parse().map_err(|_| malformed(line))?;
        count += 1;
    }
    if count != 6 || rest.split(',').count() != 6 {
        return Err(malformed(line));
    }
    Ok(joints)
}

fn parse_int_map(line: &str, rest: &str) -> Result<BTreeMap<u16, i32>, SessionError> {
    let mut map = BTreeMap::new();
    for pair in rest.split(',').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once(':').ok_or_else(|| malformed(line))?;
        map.insert(
            k.trim().parse().map_err(|_| malformed(line))?,
            v.trim().parse().map_err(|_| malformed(line))?,
        );
    }
    Ok(map)
}

fn parse_register_map(
    line: &str,
    rest: &str,
) -> Result<BTreeMap<u16, RegisterValue>, SessionError> {
    let mut map = BTreeMap::new();
    for pair in rest.split(',').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once(':').ok_or_else(|| malformed(line))?;
        if v.trim() == "ERR" {
            // the device could not read this register this tick
            continue;
        }
        let (i, r) = v.split_once('|').ok_or_else(|| malformed(line))?;
        map.insert(
            k.trim().parse().map_err(|_| malformed(line))?,
            RegisterValue {
                i: i.trim().parse().map_err(|_| malformed(line))?,
                r: r.trim().parse().map_err(|_| malformed(line))?,
            },
        );
    }
    Ok(map)
}

fn parse_var_map(line: &str, rest: &str) -> Result<BTreeMap<String, String>, SessionError> {
    let mut map = BTreeMap::new();
    for pair in rest.split(',').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once(':').ok_or_else(|| malformed(line))?;
        map.insert(name.to_string(), value.to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DeviceSession, SessionEvent, SessionTuning};
    use crate::transport::{SimRobotConnector, SimRobotDevice};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use twinsync_core::DeviceStatus;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parser_reads_all_known_sections() {
        let frame = parse_fast_frame(&lines(&[
            "J=1.5,2.5,3.5,4.5,5.5,6.5",
            "DI=105:1,113:0",
            "GI=1:7",
            "GO=1:0",
            "DO=2:1",
            "R=5:3|2.5,6:ERR",
            "VAR=$SPEED:100:fine",
            "ZZZ=ignored",
        ]))
        .unwrap();
        assert_eq!(frame.joints_deg, Some([1.5, 2.5, 3.5, 4.5, 5.5, 6.5]));
        assert_eq!(frame.di.get(&105), Some(&1));
        assert_eq!(frame.di.get(&113), Some(&0));
        assert_eq!(frame.gi.get(&1), Some(&7));
        assert_eq!(frame.r.get(&5), Some(&RegisterValue { i: 3, r: 2.5 }));
        // ERR registers are skipped, not fatal
        assert!(!frame.r.contains_key(&6));
        // VAR rest is verbatim past the first colon
        assert_eq!(frame.var.get("$SPEED").map(String::as_str), Some("100:fine"));
    }

    #[test]
    fn parser_rejects_garbage_under_known_prefix() {
        assert!(parse_fast_frame(&lines(&["DI=abc"])).is_err());
        assert!(parse_fast_frame(&lines(&["J=1,2,3"])).is_err());
        assert!(parse_fast_frame(&lines(&["R=5:nope"])).is_err());
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

    struct Rig {
        device: Arc<SimRobotDevice>,
        session: Arc<RobotSession>,
        supervisor: Arc<DeviceSession<RobotSession>>,
        events: UnboundedReceiver<SessionEvent>,
    }

    fn rig(tuning: RobotTuning) -> Rig {
        let (tx, events) = unbounded_channel();
        let device = SimRobotDevice::new();
        let core = SessionCore::new(
            DeviceKey::new("acme", "gw0", "R1", "robot-fanuc"),
            tx,
        );
        let session = RobotSession::new(
            core.clone(),
            &robot_cfg(),
            Box::new(SimRobotConnector::new(device.clone())),
            tuning,
        );
        let supervisor = DeviceSession::new(
            core,
            session.clone(),
            SessionTuning {
                reconnect_step: Duration::from_millis(20),
                ..Default::default()
            },
        );
        Rig {
            device,
            session,
            supervisor,
            events,
        }
    }

    async fn next_status(events: &mut UnboundedReceiver<SessionEvent>) -> Option<DeviceStatus> {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(SessionEvent::Status { status, .. })) => return Some(status),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    async fn next_frame_seq(events: &mut UnboundedReceiver<SessionEvent>) -> Option<u64> {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(SessionEvent::Frame { frame, .. })) => return Some(frame.seq()),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn two_user_plans_union_onto_the_device() {
        let mut rig = rig(RobotTuning::default());
        rig.supervisor.connect().await.unwrap();

        rig.session
            .apply_telemetry_plan(
                "userA",
                TelemetryPlan {
                    di: vec![105],
                    gi: vec![1],
                    go: vec![1],
                    ..Default::default()
                },
            )
            .await;
        rig.session
            .apply_telemetry_plan(
                "userB",
                TelemetryPlan {
                    di: vec![113, 105],
                    gi: vec![2],
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(rig.device.applied("DI").as_deref(), Some("105,113"));
        assert_eq!(rig.device.applied("GI").as_deref(), Some("1,2"));
        assert_eq!(rig.device.applied("GO").as_deref(), Some("1"));
        assert!(rig.session.core().publish_allowed());

        rig.supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn frame_sequence_is_strictly_monotonic() {
        let mut rig = rig(RobotTuning::default());
        rig.supervisor.connect().await.unwrap();
        rig.session
            .apply_telemetry_plan(
                "userA",
                TelemetryPlan {
                    di: vec![105],
                    ..Default::default()
                },
            )
            .await;

        let a = next_frame_seq(&mut rig.events).await.unwrap();
        let b = next_frame_seq(&mut rig.events).await.unwrap();
        let c = next_frame_seq(&mut rig.events).await.unwrap();
        assert!(a >= 1 && b > a && c > b);

        rig.supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn lease_expiry_clears_gate_and_device_plan() {
        let mut rig = rig(RobotTuning {
            lease_timeout: Duration::from_millis(80),
            reap_period: Duration::from_millis(20),
        });
        rig.supervisor.connect().await.unwrap();
        rig.session
            .apply_telemetry_plan(
                "userA",
                TelemetryPlan {
                    di: vec![105],
                    ..Default::default()
                },
            )
            .await;
        assert!(rig.session.core().publish_allowed());

        // Never heartbeat; the reaper must clear everything.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!rig.session.core().publish_allowed());
        assert_eq!(rig.device.applied("DI").as_deref(), Some(""));

        rig.supervisor.disconnect().await;
        drop(rig.events);
    }

    #[tokio::test]
    async fn reconnect_reapplies_union_before_streaming() {
        let mut rig = rig(RobotTuning::default());
        rig.supervisor.connect().await.unwrap();
        rig.session
            .apply_telemetry_plan(
                "userA",
                TelemetryPlan {
                    di: vec![105],
                    ..Default::default()
                },
            )
            .await;
        next_frame_seq(&mut rig.events).await.unwrap();

        rig.device.drop_reads(1);

        // Collect the fault/recovery trace.
        let mut trace = Vec::new();
        while trace.last() != Some(&DeviceStatus::Streaming) {
            match next_status(&mut rig.events).await {
                Some(status) => trace.push(status),
                None => break,
            }
        }
        let expect = [
            DeviceStatus::Faulted,
            DeviceStatus::Connecting,
            DeviceStatus::Connected,
            DeviceStatus::Streaming,
        ];
        let mut want = expect.iter();
        let mut next = want.next();
        for status in &trace {
            if Some(status) == next {
                next = want.next();
            }
        }
        assert!(next.is_none(), "incomplete recovery trace: {trace:?}");

        // Second connection, union re-sent, frames flowing again.
        assert_eq!(rig.device.connect_count(), 2);
        assert_eq!(rig.device.applied("DI").as_deref(), Some("105"));
        next_frame_seq(&mut rig.events).await.unwrap();

        rig.supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn non_ok_plan_reply_fails_first_connect() {
        let rig = rig(RobotTuning::default());
        rig.session
            .apply_telemetry_plan(
                "userA",
                TelemetryPlan {
                    di: vec![105],
                    ..Default::default()
                },
            )
            .await;
        rig.device.nak_plans(true);

        let err = rig.supervisor.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)), "{err}");
        assert_eq!(rig.supervisor.status(), DeviceStatus::Disconnected);
    }

    #[tokio::test]
    async fn stalled_read_is_classified_as_timeout() {
        let mut rig = rig(RobotTuning::default());
        rig.supervisor.connect().await.unwrap();
        rig.session
            .apply_telemetry_plan(
                "userA",
                TelemetryPlan {
                    di: vec![105],
                    ..Default::default()
                },
            )
            .await;
        next_frame_seq(&mut rig.events).await.unwrap();

        rig.device.stall_reads(true);
        let status = next_status(&mut rig.events).await.unwrap();
        assert_eq!(status, DeviceStatus::Faulted);

        rig.device.stall_reads(false);
        rig.supervisor.disconnect().await;
    }
}
