//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "SLMP driver wrapping the PLC session."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use m2c_common::time::secs_f64;
use m2c_model::{Protocol, SlmpConfig};
use m2c_protocols::slmp::SlmpClient;
use serde_json::{json, Value};

use crate::driver::{DeviceDriver, PollOutcome};
use crate::Result;

/// Polls every configured attribute of one PLC. The serial counter lives in the
/// client and survives reconnects.
#[derive(Debug)]
pub struct SlmpDriver {
    client: SlmpClient,
    interval: Duration,
    iterations: u32,
}

impl SlmpDriver {
    pub fn new(config: &SlmpConfig) -> Result<Self> {
        Ok(Self::with_client(SlmpClient::new(config)?, config))
    }

    pub fn with_client(client: SlmpClient, config: &SlmpConfig) -> Self {
        Self {
            client,
            interval: secs_f64(config.machine_query_time_interval),
            iterations: config.machine_query_iterations.max(1),
        }
    }
}

#[async_trait]
impl DeviceDriver for SlmpDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Slmp
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn iterations(&self) -> u32 {
        self.iterations
    }

    async fn open(&mut self) -> Result<()> {
        if !self.client.is_connected() {
            self.client.connect().await?;
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<PollOutcome> {
        Ok(PollOutcome::samples(self.client.poll().await?))
    }

    async fn diagnose(&mut self) -> Result<Value> {
        self.open().await?;
        let samples = self.client.poll().await?;
        Ok(json!({
            "address": self.client.address(),
            "reads": self.client.reads().len(),
            "values": samples.len(),
            "lastSerial": self.client.last_serial(),
        }))
    }

    async fn close(&mut self) {
        self.client.close();
    }
}
