//! Egress pump: gated, depth-1, latest-wins publisher.
//!
//! Per device the pump keeps at most one cached frame and an enabled
//! bit, both behind the same mutex: disabling a device removes it from
//! BOTH maps in one critical section, which is what guarantees a frame
//! can never be republished after the last user left. Producers never
//! block; if frames arrive faster than the tick, intermediate ones are
//! simply overwritten.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::mqtt::{MqttLink, QosLevel};
use twinsync_core::{DataEnvelope, DeviceKey, Frame, FramePayload};

#[derive(Default)]
struct PumpState {
    enabled: HashSet<DeviceKey>,
    latest: HashMap<DeviceKey, Frame>,
}

pub struct EgressPump {
    link: Arc<dyn MqttLink>,
    state: StdMutex<PumpState>,
    pub_seq: AtomicU64,
    cancel: CancellationToken,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

impl EgressPump {
    /// Create the pump and spawn its ticker.
    pub fn start(link: Arc<dyn MqttLink>, period: Duration) -> Arc<Self> {
        let pump = Arc::new(Self {
            link,
            state: StdMutex::new(PumpState::default()),
            pub_seq: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            ticker: StdMutex::new(None),
        });

        let tick_pump = pump.clone();
        let cancel = pump.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                tick_pump.publish_pending().await;
            }
        });
        *pump.ticker.lock().unwrap() = Some(handle);
        pump
    }

    /// Flip the per-device gate. Disabling removes the device from the
    /// enabled set AND drops its cached frame, atomically.
    pub fn set_publish_allowed(&self, key: &DeviceKey, allowed: bool) {
        let mut state = self.state.lock().unwrap();
        if allowed {
            state.enabled.insert(key.clone());
        } else {
            state.enabled.remove(key);
            state.latest.remove(key);
        }
    }

    /// Offer a frame. Silently dropped unless the device is enabled,
    /// so a racing producer cannot refill the cache after a disable.
    pub fn enqueue(&self, key: &DeviceKey, frame: Frame) {
        let mut state = self.state.lock().unwrap();
        if !state.enabled.contains(key) {
            return;
        }
        state.latest.insert(key.clone(), frame);
    }

    pub fn clear_device(&self, key: &DeviceKey) {
        let mut state = self.state.lock().unwrap();
        state.enabled.remove(key);
        state.latest.remove(key);
    }

    pub fn clear_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.enabled.clear();
        state.latest.clear();
    }

    /// One pump tick: snapshot the enabled caches in a single critical
    /// section, then publish outside the lock.
    pub async fn publish_pending(&self) {
        let snapshot: Vec<(DeviceKey, Frame)> = {
            let state = self.state.lock().unwrap();
            state
                .latest
                .iter()
                .filter(|(key, _)| state.enabled.contains(*key))
                .map(|(key, frame)| (key.clone(), frame.clone()))
                .collect()
        };

        for (key, frame) in snapshot {
            let envelope = DataEnvelope {
                pub_seq: self.pub_seq.fetch_add(1, Ordering::SeqCst) + 1,
                ts: chrono::Utc::now().timestamp_millis(),
                frame_seq: frame.seq(),
                device_type: &key.device_type,
                device_id: &key.device_id,
                payload: FramePayload::from(&frame),
            };
            let payload = match serde_json::to_vec(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("egress: cannot serialize frame for {key}: {e}");
                    continue;
                }
            };
            if let Err(e) = self
                .link
                .publish(&key.data_topic(), payload, QosLevel::AtMostOnce, false)
                .await
            {
                log::warn!("egress: publish for {key} failed: {e}");
            }
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for EgressPump {
    fn drop(&mut self) {
        self.stop();
    }
}
