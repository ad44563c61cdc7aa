//! ---
//! m2c_section: "02-messaging-ipc-data-model"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "MQTT-backed message bus."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use m2c_common::MqttConfig;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{log_message, route_inbound, BusMessage, DeliveryQos, MessageBus, MessageDirection};
use crate::{MessagingError, Result, Subscription};

const REQUEST_CAPACITY: usize = 64;
const SUBSCRIPTION_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

type Routes = Arc<Mutex<Vec<(String, mpsc::Sender<BusMessage>)>>>;

/// Message bus backed by an MQTT broker connection.
///
/// The event loop runs on its own task; inbound publishes are routed to
/// subscriptions by topic filter and subscriptions are re-issued after a
/// reconnect. Subscriptions use at-most-once delivery.
pub struct MqttBus {
    client: AsyncClient,
    routes: Routes,
    subacks: broadcast::Sender<Vec<SubscribeReasonCode>>,
    subscribe_timeout: Duration,
    publish_qos: DeliveryQos,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("subscribe_timeout", &self.subscribe_timeout)
            .field("publish_qos", &self.publish_qos)
            .finish_non_exhaustive()
    }
}

impl MqttBus {
    /// Create the client and spawn its event loop. Must run inside a Tokio runtime.
    pub fn connect(config: &MqttConfig, default_client_id: &str, subscribe_timeout: Duration) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| default_client_id.to_owned());
        let mut options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive.max(MIN_KEEP_ALIVE));
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let routes: Routes = Arc::new(Mutex::new(Vec::new()));
        let (subacks, _) = broadcast::channel(16);
        let (shutdown, shutdown_rx) = watch::channel(false);
        info!(host = %config.host, port = config.port, client_id = %client_id, "mqtt bus starting");
        let task = tokio::spawn(drive(
            eventloop,
            client.clone(),
            Arc::clone(&routes),
            subacks.clone(),
            shutdown_rx,
        ));

        Self {
            client,
            routes,
            subacks,
            subscribe_timeout,
            publish_qos: DeliveryQos::AtLeastOnce,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Disconnect from the broker and stop the event loop.
    pub async fn shutdown(&self) {
        if let Err(err) = self.client.disconnect().await {
            debug!(error = %err, "mqtt disconnect request failed");
        }
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                let _ = self.shutdown.send(true);
                if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                    task.abort();
                }
            }
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    routes: Routes,
    subacks: broadcast::Sender<Vec<SubscribeReasonCode>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connected_before = false;
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if connected_before {
                    let mut filters: Vec<String> =
                        routes.lock().iter().map(|(filter, _)| filter.clone()).collect();
                    filters.sort();
                    filters.dedup();
                    for filter in filters {
                        if let Err(err) = client.try_subscribe(filter.clone(), QoS::AtMostOnce) {
                            warn!(topic = %filter, error = %err, "failed to re-subscribe after reconnect");
                        }
                    }
                }
                connected_before = true;
                info!("mqtt connection established");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                };
                log_message(
                    MessageDirection::Inbound,
                    "mqtt",
                    &message.topic,
                    message.payload.len(),
                );
                if let Err(err) = route_inbound(&routes, message) {
                    debug!(topic = %publish.topic, error = %err, "inbound message dropped");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let _ = subacks.send(ack.return_codes);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("mqtt disconnected");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "mqtt connection error; reconnecting");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    /// Queues without waiting: while the broker is unreachable the request
    /// queue fills up and further publishes fail instead of blocking callers.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        log_message(MessageDirection::Outbound, self.name(), topic, payload.len());
        self.client
            .try_publish(topic, self.publish_qos.into(), false, payload)?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.routes.lock().push((filter.to_owned(), tx));
        let mut acks = self.subacks.subscribe();
        self.client.subscribe(filter, QoS::AtMostOnce).await?;

        match tokio::time::timeout(self.subscribe_timeout, acks.recv()).await {
            Ok(Ok(codes))
                if codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_))) =>
            {
                info!(topic = filter, "subscription active");
                Ok(Subscription::new(filter, rx))
            }
            Ok(Ok(_)) => Err(MessagingError::SubscriptionRejected(filter.to_owned())),
            Ok(Err(_)) => Err(MessagingError::Closed("mqtt event loop stopped")),
            Err(_) => Err(MessagingError::SubscribeTimeout {
                topic: filter.to_owned(),
                seconds: self.subscribe_timeout.as_secs(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}
