//! ---
//! m2c_section: "02-messaging-ipc-data-model"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Connection definitions and canonical telemetry records."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
//! Data model shared by the connector, publisher and control channel.
//!
//! A [`ConnectionDefinition`] is what the authoring system delivers over the
//! job topic; a [`CanonicalRecord`] is what every protocol driver emits onto the
//! local record stream regardless of the device it talks to.

pub mod definition;
pub mod protocol;
pub mod record;

pub use definition::{
    ConnectionDefinition, ControlMessage, ControlVerb, LocationHierarchy, Protocol,
};
pub use protocol::{
    ArrayLabel, ArrayLabelList, AuthMode, CommandConfig, CommunicationCode, DeviceAddress,
    DeviceReadList, DeviceReadRandomList, DeviceUnit, Ethernet, LabelReadRandomList, LabelUnit,
    ModbusCommand, ModbusReadSpec, ModbusTcpConfig, OpcDaConfig, OsiPiConfig, ProtocolConfig,
    SecondaryConfig, SlmpAttribute, SlmpConfig, Subheader, Validate,
};
pub use record::{
    partition_key, CanonicalRecord, DataPoint, Quality, RecordRule, UNREADABLE_VALUE,
};

use thiserror::Error;

/// Errors raised while decoding or validating model values.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown control verb `{0}`")]
    UnknownVerb(String),
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
    #[error("{field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("record {alias}: {rule}")]
    InvalidRecord { alias: String, rule: RecordRule },
}

impl ModelError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ModelError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;
