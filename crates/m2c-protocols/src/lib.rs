//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Device protocol codecs and clients."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
//! Device-facing half of the connector: frame codecs and async clients for
//! every supported field protocol. Clients return [`DeviceSample`]s keyed by
//! device tag; turning them into canonical records is the connector's job.

use std::time::Duration;

use m2c_model::{ModelError, Quality, UNREADABLE_VALUE};
use serde_json::Value;

pub mod modbus;
pub mod opcda;
pub mod osipi;
pub mod slmp;

/// Shared result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised by codecs and device clients.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("device answered with end code {0:#06x}")]
    EndCode(u16),
    #[error("modbus exception {code:#04x} for function {function:#04x}")]
    ModbusException { function: u8, code: u8 },
    #[error("unknown device code `{0}`")]
    UnknownDevice(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("credentials unavailable: {0}")]
    Credentials(String),
    #[error("device session is not open")]
    NotConnected,
}

impl ProtocolError {
    pub(crate) fn frame(reason: impl Into<String>) -> Self {
        ProtocolError::Frame(reason.into())
    }
}

/// Run `future` with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub(crate) async fn with_timeout<T, F>(operation: &'static str, after: Duration, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| ProtocolError::Timeout { operation, after })?
}

/// One value read from a device, before it is attached to an alias.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSample {
    pub tag: String,
    pub value: Value,
    pub quality: Option<Quality>,
    pub timestamp: Option<String>,
}

impl DeviceSample {
    pub fn new(
        tag: impl Into<String>,
        value: Value,
        quality: Quality,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            value,
            quality: Some(quality),
            timestamp: Some(timestamp.into()),
        }
    }

    /// Sample for a tag the device could not read.
    pub fn unreadable(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            value: Value::String(UNREADABLE_VALUE.to_owned()),
            quality: None,
            timestamp: None,
        }
    }

    pub fn is_unreadable(&self) -> bool {
        self.quality.is_none() && self.value.as_str() == Some(UNREADABLE_VALUE)
    }
}
