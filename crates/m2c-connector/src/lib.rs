//! ---
//! m2c_section: "04-configuration-orchestration"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Connection lifecycle, control dispatch and polling runtime."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
//! One [`Connector`] per machine connection. It accepts control messages from
//! `m2c2/job/{connectionName}`, drives the connection state machine and owns a
//! single polling task that turns device samples into canonical records on the
//! local record stream.

pub mod control;
pub mod driver;
pub mod drivers;
pub mod emitter;
pub mod poller;
pub mod state;

pub use control::{Connector, ConnectorSettings};
pub use driver::{DeviceDriver, DriverFactory, PollOutcome, ProtocolDriverFactory, OSI_PI_CURSOR_FILE};
pub use emitter::{EmitReport, IterationBuffer, RecordEmitter};
pub use poller::{ControlWord, LoopExit, PollLoop};
pub use state::{ConnectionState, StateHandle};

use m2c_model::ModelError;
use m2c_msg::MessagingError;
use m2c_persistence::PersistenceError;
use m2c_protocols::ProtocolError;

/// Result alias used throughout the connector crate.
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Errors raised while handling control messages or polling a device.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error("message addressed to connection `{got}` delivered to `{expected}`")]
    WrongConnection { expected: String, got: String },
    #[error("could not open the device session after {attempts} attempts: {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: Box<ConnectorError>,
    },
    #[error("connection is {0}, expected it to be running")]
    NotRunning(ConnectionState),
}
