//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "OPC DA driver: tag expansion, batch read and server listing."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use m2c_common::time::secs_f64;
use m2c_model::{OpcDaConfig, Protocol};
use m2c_protocols::opcda::{decode_tuple, resolve_tags, OpcDaClient};
use m2c_protocols::ProtocolError;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::driver::{DeviceDriver, PollOutcome};
use crate::Result;

/// Reads the configured tags plus every item matched by `listTags`.
pub struct OpcDaDriver {
    config: OpcDaConfig,
    client: Arc<dyn OpcDaClient>,
    tags: Vec<String>,
    open: bool,
}

impl std::fmt::Debug for OpcDaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcDaDriver")
            .field("server", &self.config.server_name)
            .field("tags", &self.tags.len())
            .field("open", &self.open)
            .finish()
    }
}

impl OpcDaDriver {
    pub fn new(config: OpcDaConfig, client: Arc<dyn OpcDaClient>) -> Self {
        Self {
            config,
            client,
            tags: Vec::new(),
            open: false,
        }
    }

    /// Tags read on every poll, available after [`DeviceDriver::open`].
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    async fn ensure_server(&self) -> Result<Vec<String>> {
        let servers = self.client.servers().await?;
        if !servers.iter().any(|name| name == &self.config.server_name) {
            return Err(ProtocolError::Server(format!(
                "OPC server `{}` is not registered on {}",
                self.config.server_name, self.config.machine_ip
            ))
            .into());
        }
        Ok(servers)
    }
}

#[async_trait]
impl DeviceDriver for OpcDaDriver {
    fn protocol(&self) -> Protocol {
        Protocol::OpcDa
    }

    fn interval(&self) -> Duration {
        secs_f64(self.config.interval)
    }

    fn iterations(&self) -> u32 {
        self.config.iterations.max(1)
    }

    async fn open(&mut self) -> Result<()> {
        self.ensure_server().await?;
        self.tags = resolve_tags(
            self.client.as_ref(),
            &self.config.tags,
            &self.config.list_tags,
        )
        .await?;
        if self.tags.is_empty() {
            warn!(server = %self.config.server_name, "no OPC DA tags configured or matched");
        }
        debug!(server = %self.config.server_name, tags = self.tags.len(), "opc da session open");
        self.open = true;
        Ok(())
    }

    async fn poll(&mut self) -> Result<PollOutcome> {
        if !self.open {
            return Err(ProtocolError::NotConnected.into());
        }
        if self.tags.is_empty() {
            return Ok(PollOutcome::default());
        }
        let tuples = match self.client.read(&self.tags).await {
            Ok(tuples) => tuples,
            Err(err) => {
                self.open = false;
                return Err(err.into());
            }
        };
        Ok(PollOutcome::samples(
            tuples.iter().filter_map(|tuple| decode_tuple(tuple)).collect(),
        ))
    }

    async fn diagnose(&mut self) -> Result<Value> {
        let servers = self.client.servers().await?;
        let mut matched = serde_json::Map::new();
        for pattern in &self.config.list_tags {
            matched.insert(pattern.clone(), json!(self.client.list(pattern).await?));
        }
        Ok(json!({
            "servers": servers,
            "listTags": matched,
        }))
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2c_model::UNREADABLE_VALUE;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeServer {
        reads: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl OpcDaClient for FakeServer {
        async fn servers(&self) -> m2c_protocols::Result<Vec<String>> {
            Ok(vec!["Matrikon.OPC.Simulation.1".into()])
        }

        async fn list(&self, pattern: &str) -> m2c_protocols::Result<Vec<String>> {
            assert_eq!(pattern, "Random.*");
            Ok(vec!["Random.Int4".into(), "Random.Real8".into()])
        }

        async fn read(&self, tags: &[String]) -> m2c_protocols::Result<Vec<Vec<Value>>> {
            self.reads.lock().push(tags.to_vec());
            Ok(vec![
                vec![
                    json!("Random.Int4"),
                    json!(27652.13),
                    json!("Good"),
                    json!("2021-06-03 15:14:21.247000+00:00"),
                ],
                vec![json!("Random.Real8")],
            ])
        }
    }

    fn config(server: &str) -> OpcDaConfig {
        OpcDaConfig {
            server_name: server.into(),
            machine_ip: "127.0.0.1".into(),
            tags: vec!["Random.Int4".into()],
            list_tags: vec!["Random.*".into()],
            iterations: 2,
            interval: 0.5,
            gateway_port: 7766,
        }
    }

    #[tokio::test]
    async fn open_expands_patterns_and_poll_decodes_tuples() {
        let server = Arc::new(FakeServer::default());
        let mut driver = OpcDaDriver::new(config("Matrikon.OPC.Simulation.1"), server.clone());
        assert!(driver.poll().await.is_err());
        driver.open().await.unwrap();
        assert_eq!(driver.tags(), ["Random.Int4", "Random.Real8"]);
        assert_eq!(driver.iterations(), 2);
        assert_eq!(driver.interval(), Duration::from_millis(500));

        let outcome = driver.poll().await.unwrap();
        assert_eq!(outcome.samples.len(), 2);
        assert_eq!(outcome.samples[0].value, json!(27652.13));
        assert_eq!(outcome.samples[1].value, json!(UNREADABLE_VALUE));
        assert_eq!(server.reads.lock().len(), 1);
    }

    #[tokio::test]
    async fn unknown_server_fails_to_open() {
        let mut driver = OpcDaDriver::new(config("Other.Server"), Arc::new(FakeServer::default()));
        assert!(driver.open().await.is_err());
        let report = driver.diagnose().await.unwrap();
        assert_eq!(report["servers"], json!(["Matrikon.OPC.Simulation.1"]));
        assert_eq!(report["listTags"]["Random.*"][1], "Random.Real8");
    }
}
