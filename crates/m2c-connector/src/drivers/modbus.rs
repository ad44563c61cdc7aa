//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Modbus-TCP driver scheduling each secondary at its own frequency."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use m2c_common::time::{format_millis, secs_f64};
use m2c_model::{ModbusCommand, ModbusReadSpec, ModbusTcpConfig, Protocol, Quality};
use m2c_protocols::modbus::{response_value, tag_name, ModbusClient};
use m2c_protocols::{DeviceSample, ProtocolError};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::driver::{DeviceDriver, PollOutcome};
use crate::Result;

/// One enabled command of one secondary.
#[derive(Debug, Clone, Copy)]
struct SubTask {
    secondary: u8,
    command: ModbusCommand,
    spec: ModbusReadSpec,
}

#[derive(Debug, Clone)]
struct SecondarySchedule {
    secondary: u8,
    /// Read on every `every`-th tick of the base interval.
    every: u64,
    tasks: Vec<SubTask>,
}

/// Wakes at the shortest secondary frequency and reads every secondary whose
/// period has elapsed. A missing response is logged and skipped.
#[derive(Debug)]
pub struct ModbusDriver {
    config: ModbusTcpConfig,
    client: ModbusClient,
    schedule: Vec<SecondarySchedule>,
    tick: u64,
}

impl ModbusDriver {
    pub fn new(config: ModbusTcpConfig) -> Self {
        let client = ModbusClient::new(&config.host, config.host_port);
        Self::with_client(config, client)
    }

    pub fn with_client(config: ModbusTcpConfig, client: ModbusClient) -> Self {
        let base = config.base_interval();
        let schedule = config
            .modbus_secondaries_config
            .iter()
            .map(|secondary| {
                let ratio = (secondary.frequency_in_seconds / base).round();
                SecondarySchedule {
                    secondary: secondary.secondary_address,
                    every: if ratio.is_finite() && ratio >= 1.0 {
                        ratio as u64
                    } else {
                        1
                    },
                    tasks: secondary
                        .command_config
                        .enabled()
                        .into_iter()
                        .map(|(command, spec)| SubTask {
                            secondary: secondary.secondary_address,
                            command,
                            spec,
                        })
                        .collect(),
                }
            })
            .collect();
        Self {
            config,
            client,
            schedule,
            tick: 0,
        }
    }

    fn due(&self) -> Vec<SubTask> {
        self.schedule
            .iter()
            .filter(|secondary| self.tick % secondary.every == 0)
            .flat_map(|secondary| secondary.tasks.iter().copied())
            .collect()
    }

    async fn run_task(&mut self, task: SubTask) -> std::result::Result<DeviceSample, ProtocolError> {
        if !self.client.is_connected() {
            self.client.connect().await?;
        }
        let response = self.client.read(task.secondary, task.command, task.spec).await?;
        Ok(DeviceSample::new(
            tag_name(&self.config.host_tag, task.secondary, task.command, task.spec.address),
            response_value(&response),
            Quality::Good,
            format_millis(Utc::now()),
        ))
    }
}

#[async_trait]
impl DeviceDriver for ModbusDriver {
    fn protocol(&self) -> Protocol {
        Protocol::ModbusTcp
    }

    fn interval(&self) -> Duration {
        secs_f64(self.config.base_interval())
    }

    async fn open(&mut self) -> Result<()> {
        self.client.connect().await?;
        self.tick = 0;
        Ok(())
    }

    /// Fails only when every due read failed at the transport level; exception
    /// responses count as an answer from the device.
    async fn poll(&mut self) -> Result<PollOutcome> {
        let due = self.due();
        self.tick = self.tick.wrapping_add(1);
        let mut samples = Vec::with_capacity(due.len());
        let mut answered = 0usize;
        let mut last_error = None;
        for task in &due {
            match self.run_task(*task).await {
                Ok(sample) => {
                    answered += 1;
                    samples.push(sample);
                }
                Err(err @ ProtocolError::ModbusException { .. }) => {
                    answered += 1;
                    warn!(
                        host = %self.client.address(),
                        secondary = task.secondary,
                        command = %task.command,
                        error = %err,
                        "modbus exception response"
                    );
                }
                Err(err) => {
                    warn!(
                        host = %self.client.address(),
                        secondary = task.secondary,
                        command = %task.command,
                        error = %err,
                        "modbus response missing"
                    );
                    last_error = Some(err);
                }
            }
        }
        debug!(due = due.len(), values = samples.len(), "modbus tick complete");
        match (answered, last_error) {
            (0, Some(err)) => Err(err.into()),
            _ => Ok(PollOutcome::samples(samples)),
        }
    }

    async fn diagnose(&mut self) -> Result<Value> {
        if !self.client.is_connected() {
            self.client.connect().await?;
        }
        let mut secondaries = Vec::new();
        for schedule in self.schedule.clone() {
            let Some(task) = schedule.tasks.first().copied() else {
                continue;
            };
            let status = match self.run_task(task).await {
                Ok(sample) => json!({"tag": sample.tag, "value": sample.value}),
                Err(err) => json!({"error": err.to_string()}),
            };
            secondaries.push(json!({"secondaryAddress": schedule.secondary, "result": status}));
        }
        Ok(json!({
            "host": self.client.address(),
            "secondaries": secondaries,
        }))
    }

    async fn close(&mut self) {
        self.client.close();
    }
}
