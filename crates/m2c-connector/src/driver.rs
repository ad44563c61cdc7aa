//! ---
//! m2c_section: "04-configuration-orchestration"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Device driver seam between the polling loop and protocol clients."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use m2c_model::{ConnectionDefinition, Protocol, ProtocolConfig};
use m2c_persistence::TimeCursorFile;
use m2c_protocols::opcda::HttpOpcDaClient;
use m2c_protocols::osipi::{PiAuth, PiWebClient};
use m2c_protocols::DeviceSample;
use serde_json::Value;

use crate::drivers::{ModbusDriver, OpcDaDriver, OsiPiDriver, SlmpDriver};
use crate::Result;

/// File holding the OSI PI last-read instant inside the connection directory.
pub const OSI_PI_CURSOR_FILE: &str = "osi-pi-cursor";

/// Result of one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOutcome {
    pub samples: Vec<DeviceSample>,
    /// Overrides the nominal interval before the next poll (OSI PI catch-up).
    pub next_delay: Option<Duration>,
}

impl PollOutcome {
    pub fn samples(samples: Vec<DeviceSample>) -> Self {
        Self {
            samples,
            next_delay: None,
        }
    }
}

/// Unified interface implemented by the per-protocol drivers.
///
/// A driver owns the live device session. It is moved into the polling task,
/// so only that task ever touches the session.
#[async_trait]
pub trait DeviceDriver: Send {
    fn protocol(&self) -> Protocol;

    /// Nominal delay between poll starts.
    fn interval(&self) -> Duration;

    /// Polls buffered before one record per tag is emitted.
    fn iterations(&self) -> u32 {
        1
    }

    /// Establish the device session.
    async fn open(&mut self) -> Result<()>;

    /// Read every configured tag once.
    async fn poll(&mut self) -> Result<PollOutcome>;

    /// One diagnostic round trip for `push`, described as JSON.
    async fn diagnose(&mut self) -> Result<Value>;

    /// Release the device session. Must be safe to call repeatedly.
    async fn close(&mut self);
}

/// Builds drivers from accepted definitions.
pub trait DriverFactory: Send + Sync {
    fn create(&self, definition: &ConnectionDefinition) -> Result<Box<dyn DeviceDriver>>;
}

/// Factory for the real protocol clients.
#[derive(Debug, Clone)]
pub struct ProtocolDriverFactory {
    secrets_dir: PathBuf,
    connection_dir: PathBuf,
}

impl ProtocolDriverFactory {
    pub fn new(secrets_dir: impl Into<PathBuf>, connection_dir: impl Into<PathBuf>) -> Self {
        Self {
            secrets_dir: secrets_dir.into(),
            connection_dir: connection_dir.into(),
        }
    }
}

impl DriverFactory for ProtocolDriverFactory {
    fn create(&self, definition: &ConnectionDefinition) -> Result<Box<dyn DeviceDriver>> {
        Ok(match &definition.protocol {
            ProtocolConfig::OpcDa(config) => Box::new(OpcDaDriver::new(
                config.clone(),
                Arc::new(HttpOpcDaClient::new(config)?),
            )),
            ProtocolConfig::Slmp(config) => Box::new(SlmpDriver::new(config)?),
            ProtocolConfig::ModbusTcp(config) => Box::new(ModbusDriver::new(config.clone())),
            ProtocolConfig::OsiPi(config) => {
                let auth = PiAuth::for_config(config, &self.secrets_dir)?;
                Box::new(OsiPiDriver::new(
                    config.clone(),
                    PiWebClient::new(config, auth)?,
                    TimeCursorFile::new(self.connection_dir.join(OSI_PI_CURSOR_FILE)),
                ))
            }
        })
    }
}
