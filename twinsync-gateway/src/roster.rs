//! Fleet roster: the retained device document remote UIs discover the
//! fleet through.
//!
//! The roster is an [`actix`] actor so membership and status updates
//! from every session serialize through one mailbox. A republish goes
//! out whenever the device set or any device's status changes; data
//! arrival only refreshes `last_data_ms` and rides along with the next
//! real change.

use actix::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::mqtt::{MqttLink, QosLevel};
use twinsync_core::{DeviceKey, DeviceStatus, GatewayScope, RosterDocument, RosterEntry};

struct RosterRecord {
    display_name: String,
    connection_type: String,
    status: DeviceStatus,
    last_data_ms: Option<i64>,
}

pub struct FleetRoster {
    scope: GatewayScope,
    link: Arc<dyn MqttLink>,
    devices: BTreeMap<DeviceKey, RosterRecord>,
}

impl FleetRoster {
    pub fn new(scope: GatewayScope, link: Arc<dyn MqttLink>) -> Self {
        Self {
            scope,
            link,
            devices: BTreeMap::new(),
        }
    }

    fn document(&self) -> RosterDocument {
        RosterDocument {
            ts: chrono::Utc::now().timestamp_millis(),
            tenant_id: self.scope.tenant_id.clone(),
            gateway_id: self.scope.gateway_id.clone(),
            devices: self
                .devices
                .iter()
                .map(|(key, record)| RosterEntry {
                    device_id: key.device_id.clone(),
                    device_type: key.device_type.clone(),
                    display_name: record.display_name.clone(),
                    status: record.status,
                    connection_type: record.connection_type.clone(),
                    last_data_ms: record.last_data_ms,
                })
                .collect(),
        }
    }

    fn republish(&self) {
        let topic = self.scope.devices_topic();
        let document = self.document();
        let link = self.link.clone();
        let payload = match serde_json::to_vec(&document) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("roster: cannot serialize document: {e}");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = link
                .publish(&topic, payload, QosLevel::AtLeastOnce, true)
                .await
            {
                log::warn!("roster: publish failed: {e}");
            }
        });
    }
}

impl Actor for FleetRoster {
    type Context = Context<Self>;
}

/// Add a device to the roster (or refresh its display metadata).
#[derive(Message)]
#[rtype(result = "()")]
pub struct UpsertDevice {
    pub key: DeviceKey,
    pub display_name: String,
    pub connection_type: String,
}

impl Handler<UpsertDevice> for FleetRoster {
    type Result = ();

    fn handle(&mut self, msg: UpsertDevice, _ctx: &mut Self::Context) -> Self::Result {
        log::info!("roster: device {} ({})", msg.key, msg.connection_type);
        self.devices.insert(
            msg.key,
            RosterRecord {
                display_name: msg.display_name,
                connection_type: msg.connection_type,
                status: DeviceStatus::Disconnected,
                last_data_ms: None,
            },
        );
        self.republish();
    }
}

/// Session status change.
#[derive(Message)]
#[rtype(result = "()")]
pub struct StatusUpdate {
    pub key: DeviceKey,
    pub status: DeviceStatus,
}

impl Handler<StatusUpdate> for FleetRoster {
    type Result = ();

    fn handle(&mut self, msg: StatusUpdate, _ctx: &mut Self::Context) -> Self::Result {
        let Some(record) = self.devices.get_mut(&msg.key) else {
            log::warn!("roster: status for unknown device {}", msg.key);
            return;
        };
        if record.status == msg.status {
            return;
        }
        record.status = msg.status;
        self.republish();
    }
}

/// A frame arrived for the device; refreshes `last_data_ms` only.
#[derive(Message)]
#[rtype(result = "()")]
pub struct DataSeen {
    pub key: DeviceKey,
    pub ts_ms: i64,
}

impl Handler<DataSeen> for FleetRoster {
    type Result = ();

    fn handle(&mut self, msg: DataSeen, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(record) = self.devices.get_mut(&msg.key) {
            record.last_data_ms = Some(msg.ts_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::MemoryLink;
    use tokio::time::Duration;

    fn key() -> DeviceKey {
        DeviceKey::new("acme", "gw0", "R1", "robot-fanuc")
    }

    async fn settle() {
        // let the spawned publish land
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[actix_rt::test]
    async fn upsert_and_status_change_republish_retained() {
        let link = MemoryLink::new();
        let roster =
            FleetRoster::new(GatewayScope::new("acme", "gw0"), link.clone()).start();

        roster
            .send(UpsertDevice {
                key: key(),
                display_name: "Robot 1".into(),
                connection_type: "robot-line".into(),
            })
            .await
            .unwrap();
        roster
            .send(StatusUpdate {
                key: key(),
                status: DeviceStatus::Streaming,
            })
            .await
            .unwrap();
        settle().await;

        let published = link.published_on("twinsync/acme/gw0/devices");
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|record| record.retain));
        assert!(published
            .iter()
            .all(|record| record.qos == QosLevel::AtLeastOnce));

        let doc: RosterDocument =
            serde_json::from_slice(&published.last().unwrap().payload).unwrap();
        assert_eq!(doc.devices.len(), 1);
        assert_eq!(doc.devices[0].device_id, "R1");
        assert_eq!(doc.devices[0].status, DeviceStatus::Streaming);
    }

    #[actix_rt::test]
    async fn repeated_status_and_data_seen_do_not_republish() {
        let link = MemoryLink::new();
        let roster =
            FleetRoster::new(GatewayScope::new("acme", "gw0"), link.clone()).start();

        roster
            .send(UpsertDevice {
                key: key(),
                display_name: "Robot 1".into(),
                connection_type: "robot-line".into(),
            })
            .await
            .unwrap();
        roster
            .send(StatusUpdate {
                key: key(),
                status: DeviceStatus::Disconnected,
            })
            .await
            .unwrap();
        roster
            .send(DataSeen {
                key: key(),
                ts_ms: 123,
            })
            .await
            .unwrap();
        settle().await;

        // only the upsert published; same-status and data-seen did not
        assert_eq!(link.published_on("twinsync/acme/gw0/devices").len(), 1);
    }
}
