use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TOPIC_ROOT;

/// Global address of one device instance. Acts as the routing key for
/// both ingress (plan/hb/leave verbs) and egress (data topic).
///
/// Equality and hashing are component-wise; the canonical string form
/// is `"{tenant}/{gateway}/{type}/{device}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub tenant_id: String,
    pub gateway_id: String,
    pub device_id: String,
    pub device_type: String,
}

impl DeviceKey {
    pub fn new(
        tenant_id: impl Into<String>,
        gateway_id: impl Into<String>,
        device_id: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            gateway_id: gateway_id.into(),
            device_id: device_id.into(),
            device_type: device_type.into(),
        }
    }

    /// Egress topic for sampled frames, QoS 0, never retained.
    pub fn data_topic(&self) -> String {
        format!(
            "{}/{}/{}/data/{}/{}",
            TOPIC_ROOT, self.tenant_id, self.gateway_id, self.device_type, self.device_id
        )
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant_id, self.gateway_id, self.device_type, self.device_id
        )
    }
}
