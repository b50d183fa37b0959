//! Thin facade over the broker connection.
//!
//! Everything above this module speaks [`MqttLink`]; the concrete
//! [`RumqttLink`] drives a `rumqttc` client (TLS 1.2 with client
//! certificate auth when the config carries PEM material), and
//! [`MemoryLink`] is the in-process double used by tests and the
//! simulator. Inbound messages are dispatched to the registered
//! handlers sequentially, and a failing handler is logged and skipped
//! so one bad handler cannot break the chain.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};

use twinsync_core::MqttConfig;

#[derive(Error, Debug)]
pub enum MqttLinkError {
    #[error("mqtt client error: {0}")]
    Client(String),
    #[error("tls material unreadable: {0}")]
    Tls(#[from] std::io::Error),
}

/// Delivery guarantee requested for one publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
}

impl From<QosLevel> for QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// One message as delivered to handlers.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Registered message callback. Handlers run sequentially per message
/// to preserve per-topic ordering and must not block indefinitely.
pub type MessageHandler =
    Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// The connection surface the gateway consumes.
#[async_trait]
pub trait MqttLink: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), MqttLinkError>;
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<(), MqttLinkError>;
    fn is_connected(&self) -> bool;
    fn add_handler(&self, handler: MessageHandler);
}

async fn dispatch(handlers: &StdMutex<Vec<MessageHandler>>, message: InboundMessage) {
    // Snapshot so a handler registering another handler cannot deadlock.
    let snapshot: Vec<MessageHandler> = handlers.lock().unwrap().clone();
    for handler in snapshot {
        if let Err(e) = handler(message.clone()).await {
            log::error!("message handler failed on {}: {e}", message.topic);
        }
    }
}

/// Broker connection backed by `rumqttc`.
///
/// The event-loop task is spawned once at connect time and owns the
/// inbound dispatch; `add_handler` only appends to the handler list.
/// Poll errors flip `is_connected` and back off before the next poll;
/// `rumqttc` re-establishes the session transparently.
pub struct RumqttLink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    handlers: Arc<StdMutex<Vec<MessageHandler>>>,
}

impl RumqttLink {
    pub async fn connect(cfg: &MqttConfig) -> Result<Arc<Self>, MqttLinkError> {
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));

        if let (Some(ca), Some(cert), Some(key)) =
            (&cfg.ca_path, &cfg.cert_path, &cfg.key_path)
        {
            let ca = tokio::fs::read(ca).await?;
            let client_cert = tokio::fs::read(cert).await?;
            let client_key = tokio::fs::read(key).await?;
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((client_cert, client_key)),
            }));
        }

        let (client, mut event_loop) = AsyncClient::new(options, 128);
        let connected = Arc::new(AtomicBool::new(false));
        let handlers: Arc<StdMutex<Vec<MessageHandler>>> = Arc::new(StdMutex::new(Vec::new()));

        let loop_connected = connected.clone();
        let loop_handlers = handlers.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        log::info!("mqtt broker session established");
                        loop_connected.store(true, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        dispatch(
                            &loop_handlers,
                            InboundMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            },
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        loop_connected.store(false, Ordering::SeqCst);
                        log::warn!("mqtt poll error, retrying: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            client,
            connected,
            handlers,
        }))
    }
}

#[async_trait]
impl MqttLink for RumqttLink {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), MqttLinkError> {
        self.client
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| MqttLinkError::Client(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<(), MqttLinkError> {
        self.client
            .subscribe(filter, qos.into())
            .await
            .map_err(|e| MqttLinkError::Client(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn add_handler(&self, handler: MessageHandler) {
        self.handlers.lock().unwrap().push(handler);
    }
}

/// One record kept by [`MemoryLink`] per publish.
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retain: bool,
}

/// In-process link: records publishes, lets a test inject inbound
/// messages through the same sequential dispatch path the real link
/// uses.
#[derive(Default)]
pub struct MemoryLink {
    handlers: StdMutex<Vec<MessageHandler>>,
    published: StdMutex<Vec<PublishedRecord>>,
    subscriptions: StdMutex<Vec<String>>,
}

impl MemoryLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an inbound message to every registered handler, in
    /// registration order.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        dispatch(
            &self.handlers,
            InboundMessage {
                topic: topic.to_string(),
                payload: payload.into(),
            },
        )
        .await;
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedRecord> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl MqttLink for MemoryLink {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), MqttLinkError> {
        self.published.lock().unwrap().push(PublishedRecord {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QosLevel) -> Result<(), MqttLinkError> {
        self.subscriptions.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn add_handler(&self, handler: MessageHandler) {
        self.handlers.lock().unwrap().push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn failing_handler_does_not_break_the_chain() {
        let link = MemoryLink::new();
        let seen = Arc::new(AtomicU32::new(0));

        link.add_handler(Arc::new(|_msg| {
            Box::pin(async { Err::<(), HandlerError>("boom".into()) })
        }));
        let seen_clone = seen.clone();
        link.add_handler(Arc::new(move |_msg| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        link.inject("t/x", b"payload".to_vec()).await;
        link.inject("t/x", b"payload".to_vec()).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handlers_see_messages_in_injection_order() {
        let link = MemoryLink::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let order_clone = order.clone();
        link.add_handler(Arc::new(move |msg| {
            let order = order_clone.clone();
            Box::pin(async move {
                order
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&msg.payload).to_string());
                Ok(())
            })
        }));

        link.inject("t", b"first".to_vec()).await;
        link.inject("t", b"second".to_vec()).await;
        assert_eq!(
            order.lock().unwrap().clone(),
            vec!["first".to_string(), "second".to_string()]
        );
    }
}
