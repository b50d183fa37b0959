use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::session::PlanTarget;
use twinsync_core::DeviceKey;

/// Concurrency-safe lookup from [`DeviceKey`] to the session that owns
/// it. The ingress router resolves through here; the gateway registers
/// and evicts sessions as devices come and go.
#[derive(Default)]
pub struct SessionRegistry {
    targets: RwLock<HashMap<DeviceKey, Arc<dyn PlanTarget>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, target: Arc<dyn PlanTarget>) {
        let key = target.key().clone();
        log::debug!("registry: adding {key}");
        self.targets.write().unwrap().insert(key, target);
    }

    pub fn resolve(&self, key: &DeviceKey) -> Option<Arc<dyn PlanTarget>> {
        self.targets.read().unwrap().get(key).cloned()
    }

    pub fn evict(&self, key: &DeviceKey) {
        if self.targets.write().unwrap().remove(key).is_some() {
            log::debug!("registry: removed {key}");
        }
    }

    pub fn keys(&self) -> Vec<DeviceKey> {
        self.targets.read().unwrap().keys().cloned().collect()
    }
}
