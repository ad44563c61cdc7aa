//! ---
//! m2c_section: "09-integration-interoperability"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Publisher entry points: checkpointed stream reader, routing and sinks."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
//! The publisher reads the connector's local record stream in sequence order
//! and offers every record to each enabled sink. Progress is kept in the
//! checkpoint store so a restart replays at most one record.

pub mod convert;
pub mod health;
pub mod publisher;
pub mod sink;

pub use convert::ConversionContext;
pub use health::HealthReport;
pub use publisher::{Publisher, PublisherSettings};
pub use sink::{IotTopicSink, Sink, SinkKind, StreamSink};

/// Result alias used throughout the publisher crate.
pub type Result<T> = std::result::Result<T, PublisherError>;

/// Error type for the publisher.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error(transparent)]
    Persistence(#[from] m2c_persistence::PersistenceError),
    #[error(transparent)]
    Model(#[from] m2c_model::ModelError),
    #[error(transparent)]
    Messaging(#[from] m2c_msg::MessagingError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A record could not be expressed in a sink's payload format.
    #[error("cannot convert {alias} for {sink}: {reason}")]
    Conversion {
        sink: SinkKind,
        alias: String,
        reason: String,
    },
}
