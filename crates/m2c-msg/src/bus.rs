//! ---
//! m2c_section: "02-messaging-ipc-data-model"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Message bus abstraction and the in-memory implementation."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::topics::topic_matches;
use crate::{MessagingError, Result};

const SUBSCRIPTION_CAPACITY: usize = 64;

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryQos {
    /// Fire and forget.
    AtMostOnce,
    /// Broker acknowledges each publish.
    AtLeastOnce,
}

impl From<DeliveryQos> for rumqttc::QoS {
    fn from(qos: DeliveryQos) -> Self {
        match qos {
            DeliveryQos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            DeliveryQos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// A message seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

impl BusMessage {
    /// Decode the payload as JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Published by this process.
    Outbound,
    /// Received from a subscription.
    Inbound,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, bus: &'static str, topic: &str, bytes: usize) {
    debug!(bus, topic, bytes, direction = ?direction, "messaging activity");
}

/// Stream of messages matching one topic filter.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// Wrap a receiver fed by a bus implementation.
    pub fn new(filter: impl Into<String>, rx: mpsc::Receiver<BusMessage>) -> Self {
        Self {
            filter: filter.into(),
            rx,
        }
    }

    /// Topic filter this subscription was created with.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Next message, `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// Publish/subscribe channel used for control, replies and IoT-topic data.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a concrete topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    /// Subscribe to a topic filter, resolving once the subscription is active.
    async fn subscribe(&self, filter: &str) -> Result<Subscription>;
    /// Human-readable bus name for logging.
    fn name(&self) -> &'static str;
}

#[derive(Default)]
struct InMemoryState {
    routes: Vec<(String, mpsc::Sender<BusMessage>)>,
    published: Vec<BusMessage>,
}

/// Process-local bus that also records everything published on it.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.state.lock().published.clone()
    }

    /// Messages published on topics matching `filter`.
    pub fn published_on(&self, filter: &str) -> Vec<BusMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|message| topic_matches(filter, &message.topic))
            .cloned()
            .collect()
    }

    /// Forget the publish log.
    pub fn clear(&self) {
        self.state.lock().published.clear();
    }
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBus")
            .field("routes", &state.routes.len())
            .field("published", &state.published.len())
            .finish()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let message = BusMessage {
            topic: topic.to_owned(),
            payload: Bytes::from(payload),
        };
        log_message(MessageDirection::Outbound, self.name(), topic, message.payload.len());
        let targets: Vec<_> = {
            let mut state = self.state.lock();
            state.published.push(message.clone());
            state.routes.retain(|(_, tx)| !tx.is_closed());
            state
                .routes
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.try_send(message.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.state.lock().routes.push((filter.to_owned(), tx));
        Ok(Subscription::new(filter, rx))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Deliver an inbound message to every matching route, pruning closed ones.
pub(crate) fn route_inbound(
    routes: &Mutex<Vec<(String, mpsc::Sender<BusMessage>)>>,
    message: BusMessage,
) -> Result<()> {
    let targets: Vec<_> = {
        let mut routes = routes.lock();
        routes.retain(|(_, tx)| !tx.is_closed());
        routes
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &message.topic))
            .map(|(_, tx)| tx.clone())
            .collect()
    };
    if targets.is_empty() {
        return Err(MessagingError::Closed("no subscriber for inbound topic"));
    }
    for tx in targets {
        let _ = tx.try_send(message.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_matching_topics_only() {
        let bus = InMemoryBus::new();
        let mut jobs = bus.subscribe("m2c2/job/conn").await.unwrap();
        let mut replies = bus.subscribe("m2c2/+/conn").await.unwrap();

        bus.publish("m2c2/info/conn", b"hello".to_vec()).await.unwrap();
        assert!(jobs.try_recv().is_none());
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.topic, "m2c2/info/conn");
        assert_eq!(&reply.payload[..], b"hello");
        assert_eq!(bus.published_on("m2c2/info/#").len(), 1);
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let bus = InMemoryBus::new();
        drop(bus.subscribe("a/b").await.unwrap());
        bus.publish("a/b", vec![1]).await.unwrap();
        assert_eq!(format!("{bus:?}"), "InMemoryBus { routes: 0, published: 1 }");
    }

    #[test]
    fn qos_maps_to_mqtt() {
        assert_eq!(
            rumqttc::QoS::from(DeliveryQos::AtLeastOnce),
            rumqttc::QoS::AtLeastOnce
        );
    }
}
