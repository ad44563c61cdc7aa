//! ---
//! m2c_section: "01-core-functionality"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Shared primitives and utilities for the edge runtime."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_work_root() -> PathBuf {
    PathBuf::from("/m2c2/job")
}

fn default_stream_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_segment_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_idle_backoff() -> Duration {
    Duration::from_millis(10)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connection_retry() -> u32 {
    10
}

fn default_error_retry() -> u32 {
    5
}

fn default_retry_unit() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_wait_cap() -> Duration {
    Duration::from_secs(3)
}

fn default_subscribe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_mqtt_host() -> String {
    "localhost".to_owned()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("/m2c2/logs")
}

fn default_secrets_directory() -> PathBuf {
    PathBuf::from("/m2c2/secrets")
}

/// Runtime configuration for one connection's connector and publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    #[serde(default)]
    pub streams: StreamConfig,
    #[serde(default)]
    pub sinks: SinkFlags,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            work_root: default_work_root(),
            streams: StreamConfig::default(),
            sinks: SinkFlags::default(),
            publisher: PublisherConfig::default(),
            connector: ConnectorConfig::default(),
            control: ControlConfig::default(),
            mqtt: MqttConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub const ENV_CONFIG_PATH: &'static str = "M2C_CONFIG";

    /// Load the TOML file (explicit path, then `M2C_CONFIG`) and layer the
    /// process environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var(Self::ENV_CONFIG_PATH)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
        };
        let mut config = match file {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<RuntimeConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Overlay values from an environment lookup. Unset or blank variables leave
    /// the current value untouched.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("CONNECTION_NAME") {
            self.connection.name = value;
        }
        if let Some(value) = get("SITE_NAME") {
            self.connection.site_name = value;
        }
        if let Some(value) = get("AREA") {
            self.connection.area = value;
        }
        if let Some(value) = get("PROCESS") {
            self.connection.process = value;
        }
        if let Some(value) = get("MACHINE_NAME") {
            self.connection.machine_name = value;
        }
        if let Some(value) = get("PROTOCOL") {
            self.connection.protocol = Some(value);
        }
        if let Some(value) = get("WORK_ROOT") {
            self.work_root = PathBuf::from(value);
        }
        if let Some(value) = get("CONNECTION_GG_STREAM_NAME") {
            self.streams.local_stream = Some(value);
        }
        if let Some(value) = get("KINESIS_STREAM_NAME") {
            self.streams.kinesis_stream = Some(value);
        }
        if let Some(value) = get("TIMESTREAM_KINESIS_STREAM") {
            self.streams.timestream_stream = Some(value);
        }
        if let Some(value) = get("HISTORIAN_KINESIS_STREAM") {
            self.streams.historian_stream = Some(value);
        }
        if let Some(value) = get("SITEWISE_STREAM_NAME") {
            self.streams.sitewise_stream = Some(value);
        }
        if let Some(value) = get("COLLECTOR_ID") {
            self.streams.collector_id = Some(value);
        }
        if let Some(value) = get("LOG_LEVEL") {
            self.logging.level = Some(value);
        }
        if let Some(value) = get("MQTT_HOST") {
            self.mqtt.host = value;
        }
        if let Some(port) = get("MQTT_PORT").and_then(|value| value.parse().ok()) {
            self.mqtt.port = port;
        }

        let flags = [
            ("SEND_TO_IOT_TOPIC", &mut self.sinks.send_to_iot_topic),
            ("SEND_TO_KINESIS", &mut self.sinks.send_to_kinesis),
            ("SEND_TO_TIMESTREAM", &mut self.sinks.send_to_timestream),
            ("SEND_TO_HISTORIAN", &mut self.sinks.send_to_historian),
            ("SEND_TO_SITEWISE", &mut self.sinks.send_to_sitewise),
        ];
        for (key, slot) in flags {
            if let Some(value) = get(key) {
                *slot = parse_flag(&value);
            }
        }
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.connection.name.trim().is_empty() {
            return Err(anyhow!("connection name must be set (CONNECTION_NAME)"));
        }
        if self.streams.max_bytes == 0 {
            return Err(anyhow!("streams.max_bytes must be greater than zero"));
        }
        if self.streams.segment_bytes == 0 {
            return Err(anyhow!("streams.segment_bytes must be greater than zero"));
        }
        if self.connector.connection_retry == 0 || self.connector.error_retry == 0 {
            return Err(anyhow!("connector retry limits must be at least one"));
        }
        Ok(())
    }

    /// Directory holding the connection state file and time cursor.
    pub fn connection_dir(&self) -> PathBuf {
        self.work_root.join(format!("m2c2-{}", self.connection.name))
    }

    /// Directory holding the publisher checkpoint store.
    pub fn publisher_dir(&self) -> PathBuf {
        self.work_root
            .join(format!("m2c2-{}-publisher", self.connection.name))
    }

    /// Directory under which local and export streams are stored.
    pub fn stream_root(&self) -> PathBuf {
        self.work_root.join("streams")
    }

    /// Name of the connector -> publisher stream.
    pub fn local_stream_name(&self) -> String {
        self.streams
            .local_stream
            .clone()
            .unwrap_or_else(|| format!("m2c2_{}_stream", self.connection.name))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Identity and location hierarchy of the connection served by this process.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub site_name: String,
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub process: String,
    #[serde(default)]
    pub machine_name: String,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Independent sink selectors. Accepts both the short names and the names used
/// by the job authoring system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SinkFlags {
    #[serde(default, alias = "sendDataToIoTTopic")]
    pub send_to_iot_topic: bool,
    #[serde(default, alias = "sendDataToKinesisDataStreams")]
    pub send_to_kinesis: bool,
    #[serde(default, alias = "sendDataToTimestream")]
    pub send_to_timestream: bool,
    #[serde(default, alias = "sendDataToHistorian")]
    pub send_to_historian: bool,
    #[serde(default, alias = "sendDataToIoTSiteWise", alias = "sendToSiteWise")]
    pub send_to_sitewise: bool,
}

impl SinkFlags {
    pub fn any(&self) -> bool {
        self.send_to_iot_topic
            || self.send_to_kinesis
            || self.send_to_timestream
            || self.send_to_historian
            || self.send_to_sitewise
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub local_stream: Option<String>,
    #[serde(default = "default_stream_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: u64,
    #[serde(default)]
    pub kinesis_stream: Option<String>,
    #[serde(default)]
    pub timestream_stream: Option<String>,
    #[serde(default)]
    pub historian_stream: Option<String>,
    #[serde(default)]
    pub sitewise_stream: Option<String>,
    #[serde(default)]
    pub collector_id: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            local_stream: None,
            max_bytes: default_stream_max_bytes(),
            segment_bytes: default_segment_bytes(),
            kinesis_stream: None,
            timestream_stream: None,
            historian_stream: None,
            sitewise_stream: None,
            collector_id: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_idle_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_backoff: Duration,
    #[serde(default = "default_health_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub health_interval: Duration,
    /// Longest a single sink may take to accept one record.
    #[serde(default = "default_sink_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sink_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            idle_backoff: default_idle_backoff(),
            health_interval: default_health_interval(),
            sink_timeout: default_sink_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_connection_retry")]
    pub connection_retry: u32,
    #[serde(default = "default_error_retry")]
    pub error_retry: u32,
    /// Unit of the linear connect back-off; attempt `i` waits `(i + 1) * retry_unit`.
    #[serde(default = "default_retry_unit")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_unit: Duration,
    #[serde(default = "default_stop_wait_cap")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stop_wait_cap: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connection_retry: default_connection_retry(),
            error_retry: default_error_retry(),
            retry_unit: default_retry_unit(),
            stop_wait_cap: default_stop_wait_cap(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_subscribe_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub subscribe_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: default_subscribe_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: None,
            keep_alive: default_keep_alive(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Level name in the gateway's convention (`DEBUG`, `INFO`, `WARNING`, ...).
    #[serde(default)]
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: LogFormat::default(),
            file_prefix: None,
            level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_secrets_directory")]
    pub directory: PathBuf,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            directory: default_secrets_directory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config: RuntimeConfig = toml::from_str(
            r#"
            work_root = "/tmp/m2c"
            [connection]
            name = "from-file"
            site_name = "site"
            "#,
        )
        .unwrap();
        config.apply_env(lookup(&[
            ("CONNECTION_NAME", "press-4"),
            ("SEND_TO_SITEWISE", "True"),
            ("SEND_TO_KINESIS", "false"),
            ("COLLECTOR_ID", "collector-1"),
        ]));

        assert_eq!(config.connection.name, "press-4");
        assert_eq!(config.connection.site_name, "site");
        assert!(config.sinks.send_to_sitewise);
        assert!(!config.sinks.send_to_kinesis);
        assert_eq!(config.streams.collector_id.as_deref(), Some("collector-1"));
        assert_eq!(config.connection_dir(), PathBuf::from("/tmp/m2c/m2c2-press-4"));
        assert_eq!(
            config.publisher_dir(),
            PathBuf::from("/tmp/m2c/m2c2-press-4-publisher")
        );
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut config = RuntimeConfig::default();
        config.connection.name = "conn".into();
        config.apply_env(lookup(&[("CONNECTION_NAME", "  ")]));
        assert_eq!(config.connection.name, "conn");
        assert_eq!(config.local_stream_name(), "m2c2_conn_stream");
    }

    #[test]
    fn validate_rejects_missing_connection_name() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_parse_from_toml() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [publisher]
            idle_backoff = 25
            health_interval = 5
            sink_timeout = 750
            [connector]
            retry_unit = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.publisher.idle_backoff, Duration::from_millis(25));
        assert_eq!(config.publisher.health_interval, Duration::from_secs(5));
        assert_eq!(config.publisher.sink_timeout, Duration::from_millis(750));
        assert_eq!(config.connector.retry_unit, Duration::from_millis(10));
        assert_eq!(config.connector.connection_retry, 10);
    }

    #[test]
    fn sink_flags_accept_long_names() {
        let flags: SinkFlags = serde_json::from_str(
            r#"{"sendDataToIoTTopic": true, "sendDataToIoTSiteWise": true}"#,
        )
        .unwrap();
        assert!(flags.send_to_iot_topic);
        assert!(flags.send_to_sitewise);
        assert!(!flags.send_to_historian);
        assert!(flags.any());
    }
}
