//! ---
//! m2c_section: "02-messaging-ipc-data-model"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Control channel transports and reply envelopes."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Messaging between the connector runtime and the cloud.
//!
//! Connectors subscribe to `m2c2/job/{connectionName}` and answer on the info
//! and error topics; the IoT-topic sink publishes data on `m2c2/data/...`.
//! All of it goes through the [`MessageBus`] trait so tests can swap the MQTT
//! client for [`InMemoryBus`].

pub mod bus;
pub mod envelope;
pub mod mqtt;
pub mod topics;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by bus implementations.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The bus or subscription has been shut down.
    #[error("message bus closed: {0}")]
    Closed(&'static str),
    /// Subscription was not acknowledged in time.
    #[error("subscription to {topic} not acknowledged within {seconds}s")]
    SubscribeTimeout {
        /// Topic filter.
        topic: String,
        /// Timeout that elapsed.
        seconds: u64,
    },
    /// Broker refused the subscription.
    #[error("broker rejected subscription to {0}")]
    SubscriptionRejected(String),
    /// Client-side MQTT failure.
    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

pub use bus::{
    log_message, BusMessage, DeliveryQos, InMemoryBus, MessageBus, MessageDirection, Subscription,
};
pub use envelope::{ReplyEnvelope, ReplyKind, Replier};
pub use mqtt::MqttBus;
pub use topics::{data_topic, error_topic, info_topic, job_topic, topic_matches};
