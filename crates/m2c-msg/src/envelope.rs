//! ---
//! m2c_section: "02-messaging-ipc-data-model"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Info and error reply envelopes for the control channel."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;

use m2c_model::LocationHierarchy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::bus::MessageBus;
use crate::topics::{error_topic, info_topic};
use crate::Result;

/// Reply channel a message is sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `m2c2/info/{connectionName}`.
    Info,
    /// `m2c2/error/{connectionName}`.
    Error,
}

impl ReplyKind {
    /// Topic for `connection`.
    pub fn topic(self, connection: &str) -> String {
        match self {
            ReplyKind::Info => info_topic(connection),
            ReplyKind::Error => error_topic(connection),
        }
    }
}

/// Payload of an info or error reply: the location hierarchy plus a message.
///
/// `message` is usually a string but structured bodies (the state file for
/// `pull`, publisher health) are carried as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    /// Site / area / process / machine of the connection.
    #[serde(flatten)]
    pub location: LocationHierarchy,
    /// Free-text or structured reply body.
    pub message: Value,
}

impl ReplyEnvelope {
    /// Build an envelope.
    pub fn new(location: LocationHierarchy, message: impl Into<Value>) -> Self {
        Self {
            location,
            message: message.into(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Sends info and error replies for one connection.
#[derive(Clone)]
pub struct Replier {
    bus: Arc<dyn MessageBus>,
    connection: String,
    location: LocationHierarchy,
}

impl std::fmt::Debug for Replier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replier")
            .field("bus", &self.bus.name())
            .field("connection", &self.connection)
            .finish()
    }
}

impl Replier {
    /// Create a replier bound to a connection.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        connection: impl Into<String>,
        location: LocationHierarchy,
    ) -> Self {
        Self {
            bus,
            connection: connection.into(),
            location,
        }
    }

    /// Connection the replies are addressed from.
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Publish an info reply.
    pub async fn info(&self, message: impl Into<Value>) {
        self.send(ReplyKind::Info, message.into()).await;
    }

    /// Publish an error reply.
    pub async fn error(&self, message: impl Into<Value>) {
        self.send(ReplyKind::Error, message.into()).await;
    }

    /// Publish a reply, logging instead of failing when the bus is unavailable.
    pub async fn send(&self, kind: ReplyKind, message: Value) {
        if let Err(err) = self.try_send(kind, message).await {
            warn!(connection = %self.connection, ?kind, error = %err, "failed to publish reply");
        }
    }

    /// Publish a reply and surface bus errors.
    pub async fn try_send(&self, kind: ReplyKind, message: Value) -> Result<()> {
        let envelope = ReplyEnvelope::new(self.location.clone(), message);
        self.bus
            .publish(&kind.topic(&self.connection), envelope.to_bytes()?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBus;
    use serde_json::json;

    #[tokio::test]
    async fn replies_carry_hierarchy_and_message() {
        let bus = InMemoryBus::new();
        let replier = Replier::new(
            Arc::new(bus.clone()),
            "conn",
            LocationHierarchy::new("site", "area", "process", "machine"),
        );
        replier.info("Connection stopped.").await;
        replier.error(json!({"rule": "missing timestamp"})).await;

        let info = bus.published_on("m2c2/info/conn");
        assert_eq!(info.len(), 1);
        assert_eq!(
            info[0].json().unwrap(),
            json!({
                "siteName": "site",
                "area": "area",
                "process": "process",
                "machineName": "machine",
                "message": "Connection stopped."
            })
        );
        let errors = bus.published_on("m2c2/error/conn");
        assert_eq!(errors[0].json().unwrap()["message"]["rule"], "missing timestamp");
    }
}
