//! Device session machinery.
//!
//! A session is split the way the gateway's supervisor sees it: the
//! concrete [`DeviceSession`] supervisor owns the lifecycle (connect,
//! one polling iteration per tick, fault classification, capped-backoff
//! reconnect, teardown) and is parameterized by a [`SessionHooks`]
//! object; [`RobotSession`] and [`PlcSession`] implement the hooks and
//! layer the plan-union and demand-gating semantics on top. Both also
//! implement [`PlanTarget`], the surface the ingress router dispatches
//! verbs to.

mod plans;
mod plc;
mod robot;

pub use plc::{PlcSession, PlcTuning};
pub use robot::{RobotSession, RobotTuning};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;
use twinsync_core::{DeviceKey, DeviceStatus, Frame, MachineDataPlan, TelemetryPlan};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("device protocol error: {0}")]
    Protocol(String),
    #[error("malformed frame line {0:?}")]
    MalformedFrame(String),
    #[error("frame read timed out")]
    ReadTimeout,
    #[error("session is already connected")]
    AlreadyConnected,
    #[error("session stopped")]
    Stopped,
}

impl SessionError {
    /// Cancellation is a normal exit path, not a fault.
    fn is_stop(&self) -> bool {
        matches!(self, SessionError::Stopped)
    }
}

/// Everything a session reports upward, fanned into the gateway event
/// loop over one unbounded channel so per-session ordering is kept.
#[derive(Debug)]
pub enum SessionEvent {
    Status {
        key: DeviceKey,
        status: DeviceStatus,
        error: Option<String>,
    },
    Frame {
        key: DeviceKey,
        frame: Frame,
    },
    PublishAllowed {
        key: DeviceKey,
        allowed: bool,
    },
}

/// State shared between a supervisor and its concrete session: status,
/// the `publish_allowed` gate, the frame sequence counter and the event
/// channel. Kept behind one `Arc` so the hooks can flip the gate from
/// plan mutations without a back-reference to the supervisor.
pub struct SessionCore {
    key: DeviceKey,
    status: StdMutex<DeviceStatus>,
    publish_allowed: AtomicBool,
    seq: AtomicU64,
    events: UnboundedSender<SessionEvent>,
    run_token: StdMutex<CancellationToken>,
}

impl SessionCore {
    pub fn new(key: DeviceKey, events: UnboundedSender<SessionEvent>) -> Arc<Self> {
        Arc::new(Self {
            key,
            status: StdMutex::new(DeviceStatus::Disconnected),
            publish_allowed: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            events,
            run_token: StdMutex::new(CancellationToken::new()),
        })
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn status(&self) -> DeviceStatus {
        *self.status.lock().unwrap()
    }

    pub fn publish_allowed(&self) -> bool {
        self.publish_allowed.load(Ordering::SeqCst)
    }

    /// Edge-triggered: emits `PublishAllowed` only on an actual flip.
    pub fn set_publish_allowed(&self, allowed: bool) {
        let prev = self.publish_allowed.swap(allowed, Ordering::SeqCst);
        if prev != allowed {
            log::debug!("{}: publish allowed -> {allowed}", self.key);
            self.events
                .send(SessionEvent::PublishAllowed {
                    key: self.key.clone(),
                    allowed,
                })
                .ok();
        }
    }

    /// Next frame sequence number; starts at 1, strictly monotonic.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn transition(&self, next: DeviceStatus, error: Option<&SessionError>) {
        // Status events are serialized under the lock so observers see
        // transitions in order.
        let mut status = self.status.lock().unwrap();
        if *status == next {
            return;
        }
        log::info!("{}: {} -> {}", self.key, *status, next);
        *status = next;
        self.events
            .send(SessionEvent::Status {
                key: self.key.clone(),
                status: next,
                error: error.map(|e| e.to_string()),
            })
            .ok();
    }

    fn emit_frame(&self, frame: Frame) {
        self.events
            .send(SessionEvent::Frame {
                key: self.key.clone(),
                frame,
            })
            .ok();
    }

    fn renew_run_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.run_token.lock().unwrap() = token.clone();
        token
    }

    fn cancel_run(&self) {
        self.run_token.lock().unwrap().cancel();
    }
}

/// The seam a concrete session implements under the supervisor.
#[async_trait]
pub trait SessionHooks: Send + Sync + 'static {
    /// Build the transport and prepare the device (re-apply the current
    /// union plan). Called for the first connect and every reconnect.
    async fn on_connect(&self) -> Result<(), SessionError>;

    /// Tear the transport down. Must be total; failures are swallowed
    /// after logging.
    async fn on_disconnect(&self);

    /// One polling iteration. `Ok(None)` means the iteration legally
    /// produced nothing (e.g. an empty tag union).
    async fn read_frame(&self, cancel: &CancellationToken)
        -> Result<Option<Frame>, SessionError>;
}

/// The surface the ingress router routes verbs to.
///
/// A plan of the wrong kind for the target is a no-op, so a telemetry
/// plan accidentally addressed to a PLC changes nothing.
#[async_trait]
pub trait PlanTarget: Send + Sync {
    fn key(&self) -> &DeviceKey;
    async fn apply_telemetry_plan(&self, user: &str, plan: TelemetryPlan);
    async fn apply_machine_data_plan(&self, user: &str, plan: MachineDataPlan);
    async fn touch_user(&self, user: &str);
    async fn remove_user(&self, user: &str);
}

/// Lifecycle surface the gateway keeps per session, independent of the
/// concrete hook type.
#[async_trait]
pub trait SessionControl: Send + Sync {
    fn key(&self) -> &DeviceKey;
    fn status(&self) -> DeviceStatus;
    async fn disconnect(&self);
}

/// Supervisor pacing/backoff knobs; the defaults match production.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    /// Idle instead of reading while nobody is interested.
    pub read_only_when_publish_allowed: bool,
    /// Sleep between gate checks while idle.
    pub idle_backoff: Duration,
    /// Reconnect waits `min(reconnect_cap, reconnect_step × attempt)`.
    pub reconnect_step: Duration,
    pub reconnect_cap: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            read_only_when_publish_allowed: true,
            idle_backoff: Duration::from_millis(50),
            reconnect_step: Duration::from_millis(500),
            reconnect_cap: Duration::from_secs(10),
        }
    }
}

/// Generic supervised session: owns the transport lifecycle through the
/// hooks object and the run-loop task.
pub struct DeviceSession<H: SessionHooks> {
    core: Arc<SessionCore>,
    hooks: Arc<H>,
    tuning: SessionTuning,
    run: StdMutex<Option<JoinHandle<()>>>,
}

impl<H: SessionHooks> DeviceSession<H> {
    pub fn new(core: Arc<SessionCore>, hooks: Arc<H>, tuning: SessionTuning) -> Arc<Self> {
        Arc::new(Self {
            core,
            hooks,
            tuning,
            run: StdMutex::new(None),
        })
    }

    pub fn key(&self) -> &DeviceKey {
        self.core.key()
    }

    pub fn status(&self) -> DeviceStatus {
        self.core.status()
    }

    pub fn publish_allowed(&self) -> bool {
        self.core.publish_allowed()
    }

    pub fn set_publish_allowed(&self, allowed: bool) {
        self.core.set_publish_allowed(allowed);
    }

    /// First connect. Errors here propagate to the caller; once this
    /// has succeeded, later faults only surface through status events.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.core.status() != DeviceStatus::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }
        self.core.transition(DeviceStatus::Connecting, None);
        if let Err(e) = self.hooks.on_connect().await {
            self.core.set_publish_allowed(false);
            self.core.transition(DeviceStatus::Faulted, Some(&e));
            self.hooks.on_disconnect().await;
            self.core.transition(DeviceStatus::Disconnected, None);
            return Err(e);
        }
        self.core.transition(DeviceStatus::Connected, None);
        // Streaming goes out before the loop task can race a fault in.
        self.core.transition(DeviceStatus::Streaming, None);

        let token = self.core.renew_run_token();
        let handle = tokio::spawn(run_loop(
            self.core.clone(),
            self.hooks.clone(),
            self.tuning.clone(),
            token,
        ));
        *self.run.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Idempotent teardown. Cancels the run loop, awaits it, runs the
    /// disconnect hook. Cleanup failures are logged and swallowed.
    pub async fn disconnect(&self) {
        self.core.set_publish_allowed(false);
        self.core.cancel_run();
        let handle = self.run.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("{}: run task join failed: {e}", self.core.key());
            }
        }
        self.hooks.on_disconnect().await;
        self.core.transition(DeviceStatus::Disconnected, None);
    }
}

#[async_trait]
impl<H: SessionHooks> SessionControl for DeviceSession<H> {
    fn key(&self) -> &DeviceKey {
        self.core.key()
    }

    fn status(&self) -> DeviceStatus {
        self.core.status()
    }

    async fn disconnect(&self) {
        DeviceSession::disconnect(self).await;
    }
}

/// The supervised run loop: gate check, one `read_frame` per tick,
/// fault classification, reconnect with capped linear backoff.
async fn run_loop<H: SessionHooks>(
    core: Arc<SessionCore>,
    hooks: Arc<H>,
    tuning: SessionTuning,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if tuning.read_only_when_publish_allowed && !core.publish_allowed() {
            // No demand: stay off the wire entirely.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tuning.idle_backoff) => {}
            }
            continue;
        }
        match hooks.read_frame(&cancel).await {
            Ok(Some(frame)) => core.emit_frame(frame),
            Ok(None) => {}
            Err(e) if e.is_stop() || cancel.is_cancelled() => break,
            Err(e) => {
                log::warn!("{}: connection lost: {e}", core.key());
                core.set_publish_allowed(false);
                core.transition(DeviceStatus::Faulted, Some(&e));
                hooks.on_disconnect().await;
                core.transition(DeviceStatus::Disconnected, None);
                if !reconnect(&core, hooks.as_ref(), &tuning, &cancel).await {
                    break;
                }
            }
        }
    }
    log::debug!("{}: run loop exiting", core.key());
}

/// Retries `on_connect` until it succeeds or the session is cancelled.
/// Returns false on cancellation.
async fn reconnect<H: SessionHooks>(
    core: &SessionCore,
    hooks: &H,
    tuning: &SessionTuning,
    cancel: &CancellationToken,
) -> bool {
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let delay = tuning.reconnect_cap.min(tuning.reconnect_step * attempt);
        log::info!(
            "{}: reconnect attempt {attempt} in {:?}",
            core.key(),
            delay
        );
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        core.transition(DeviceStatus::Connecting, None);
        match hooks.on_connect().await {
            Ok(()) => {
                core.transition(DeviceStatus::Connected, None);
                core.transition(DeviceStatus::Streaming, None);
                return true;
            }
            Err(e) => {
                log::warn!("{}: reconnect failed: {e}", core.key());
                core.transition(DeviceStatus::Faulted, Some(&e));
                hooks.on_disconnect().await;
                core.transition(DeviceStatus::Disconnected, None);
            }
        }
    }
}
