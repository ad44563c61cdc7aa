//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Structured logging adapters and sinks."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Log context carried by every connector and publisher event so errors can be
//! traced back to a connection, tag and stream sequence.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogContext<'a> {
    /// Connection name the event belongs to.
    pub connection: Option<&'a str>,
    /// Device tag, when the event concerns a single telemetry channel.
    pub tag: Option<&'a str>,
    /// Local stream sequence number, when known.
    pub sequence: Option<u64>,
    /// Protocol of the connection (`opcda`, `slmp`, ...).
    pub protocol: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create a context bound to a connection.
    pub fn connection(name: &'a str) -> Self {
        Self {
            connection: Some(name),
            ..Self::default()
        }
    }

    /// Attach a tag.
    pub fn with_tag(mut self, tag: &'a str) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Attach a stream sequence number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Attach the protocol name.
    pub fn with_protocol(mut self, protocol: &'a str) -> Self {
        self.protocol = Some(protocol);
        self
    }
}
