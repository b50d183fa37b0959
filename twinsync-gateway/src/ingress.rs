//! Ingress router: one subscriber over the three plan verbs.
//!
//! Topics look like
//! `twinsync/{tenant}/{gateway}/{plan|hb|leave}/{type}/{device}/{user}`.
//! The root and verb compare case-insensitively, tenant and gateway
//! case-sensitively; anything that is not exactly seven non-empty
//! segments in this scope is dropped without a word. Malformed JSON and
//! unknown devices are logged and dropped; nothing a remote user
//! publishes can raise an error out of the handler chain.

use std::sync::Arc;

use crate::mqtt::{InboundMessage, MqttLink};
use crate::registry::SessionRegistry;
use crate::session::PlanTarget;
use twinsync_core::{DeviceKey, GatewayScope, PlanEnvelope, PlanKind, TOPIC_ROOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Plan,
    Hb,
    Leave,
}

impl Verb {
    fn parse(raw: &str) -> Option<Verb> {
        if raw.eq_ignore_ascii_case("plan") {
            Some(Verb::Plan)
        } else if raw.eq_ignore_ascii_case("hb") {
            Some(Verb::Hb)
        } else if raw.eq_ignore_ascii_case("leave") {
            Some(Verb::Leave)
        } else {
            None
        }
    }
}

pub struct IngressRouter {
    scope: GatewayScope,
    registry: Arc<SessionRegistry>,
}

impl IngressRouter {
    pub fn new(scope: GatewayScope, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self { scope, registry })
    }

    /// Register this router on the link's handler chain.
    pub fn attach(self: &Arc<Self>, link: &dyn MqttLink) {
        let router = self.clone();
        link.add_handler(Arc::new(move |message| {
            let router = router.clone();
            Box::pin(async move {
                router.handle(message).await;
                Ok(())
            })
        }));
    }

    /// Process one inbound message. Infallible on purpose: every bad
    /// input path ends in a log line, never a state change.
    pub async fn handle(&self, message: InboundMessage) {
        let Some((verb, key, user)) = self.parse_topic(&message.topic) else {
            return;
        };
        let Some(target) = self.registry.resolve(&key) else {
            log::warn!("ingress: no session for {key}, dropping {verb:?}");
            return;
        };
        match verb {
            Verb::Hb => target.touch_user(&user).await,
            Verb::Leave => target.remove_user(&user).await,
            Verb::Plan => self.dispatch_plan(target, &user, &message).await,
        }
    }

    async fn dispatch_plan(
        &self,
        target: Arc<dyn PlanTarget>,
        user: &str,
        message: &InboundMessage,
    ) {
        let envelope: PlanEnvelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("ingress: bad plan envelope on {}: {e}", message.topic);
                return;
            }
        };
        match envelope.kind {
            PlanKind::Telemetry => {
                target
                    .apply_telemetry_plan(user, envelope.into_telemetry_plan())
                    .await
            }
            PlanKind::MachineData => {
                target
                    .apply_machine_data_plan(user, envelope.into_machine_data_plan())
                    .await
            }
        }
    }

    /// Split on `/` dropping empty parts; require exactly 7 parts in
    /// this router's scope. Returns the routing key and the user id.
    fn parse_topic(&self, topic: &str) -> Option<(Verb, DeviceKey, String)> {
        let parts: Vec<&str> = topic.split('/').filter(|p| !p.is_empty()).collect();
        let [root, tenant, gateway, verb, device_type, device_id, user] = parts[..] else {
            return None;
        };
        if !root.eq_ignore_ascii_case(TOPIC_ROOT) {
            return None;
        }
        if tenant != self.scope.tenant_id || gateway != self.scope.gateway_id {
            return None;
        }
        let verb = Verb::parse(verb)?;
        let key = DeviceKey::new(
            &self.scope.tenant_id,
            &self.scope.gateway_id,
            device_id,
            device_type,
        );
        Some((verb, key, user.to_string()))
    }
}
