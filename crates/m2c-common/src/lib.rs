//! ---
//! m2c_section: "01-core-functionality"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Shared primitives and utilities for the edge runtime."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
//! Core shared primitives for the M2C edge runtime workspace.
//! This crate exposes configuration loading, tracing initialisation and the
//! timestamp helpers consumed by connectors, publisher and converters.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    ConnectionConfig, ConnectorConfig, ControlConfig, LoggingConfig, MetricsConfig, MqttConfig,
    PublisherConfig, RuntimeConfig, SecretsConfig, SinkFlags, StreamConfig,
};
pub use logging::{init_tracing, level_directive, LogFormat};
pub use time::parse_timestamp;
