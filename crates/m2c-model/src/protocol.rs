//! ---
//! m2c_section: "02-messaging-ipc-data-model"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Per-protocol definition blocks and their range checks."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::definition::Protocol;
use crate::{ModelError, Result};

/// Range and shape checks run before a definition is accepted.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Protocol block of a definition, one variant per supported protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolConfig {
    OpcDa(OpcDaConfig),
    Slmp(SlmpConfig),
    ModbusTcp(ModbusTcpConfig),
    OsiPi(OsiPiConfig),
}

impl ProtocolConfig {
    pub fn kind(&self) -> Protocol {
        match self {
            ProtocolConfig::OpcDa(_) => Protocol::OpcDa,
            ProtocolConfig::Slmp(_) => Protocol::Slmp,
            ProtocolConfig::ModbusTcp(_) => Protocol::ModbusTcp,
            ProtocolConfig::OsiPi(_) => Protocol::OsiPi,
        }
    }
}

impl Validate for ProtocolConfig {
    fn validate(&self) -> Result<()> {
        match self {
            ProtocolConfig::OpcDa(block) => block.validate(),
            ProtocolConfig::Slmp(block) => block.validate(),
            ProtocolConfig::ModbusTcp(block) => block.validate(),
            ProtocolConfig::OsiPi(block) => block.validate(),
        }
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ModelError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn require_positive(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ModelError::invalid(field, "must be a positive number of seconds"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// OPC DA
// ---------------------------------------------------------------------------

fn default_gateway_port() -> u16 {
    7766
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpcDaConfig {
    pub server_name: String,
    pub machine_ip: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Wildcard patterns expanded through the server's browse before reading.
    #[serde(default)]
    pub list_tags: Vec<String>,
    pub iterations: u32,
    /// Seconds between poll starts.
    pub interval: f64,
    /// Port of the OPC gateway service on `machineIp`.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
}

impl Validate for OpcDaConfig {
    fn validate(&self) -> Result<()> {
        require_text("opcDa.serverName", &self.server_name)?;
        require_text("opcDa.machineIp", &self.machine_ip)?;
        if self.tags.is_empty() && self.list_tags.is_empty() {
            return Err(ModelError::invalid(
                "opcDa.tags",
                "at least one of tags or listTags is required",
            ));
        }
        if self.iterations < 1 {
            return Err(ModelError::invalid("opcDa.iterations", "must be at least 1"));
        }
        require_positive("opcDa.interval", self.interval)
    }
}

// ---------------------------------------------------------------------------
// SLMP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ethernet {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationCode {
    Ascii,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Subheader {
    #[serde(rename = "with serial")]
    WithSerial,
    #[serde(rename = "without serial")]
    WithoutSerial,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceUnit {
    #[default]
    Word,
    Bit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelUnit {
    Bit,
    Byte,
}

/// Contiguous block read (`device_read`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReadList {
    pub device_code: String,
    pub head_device: u32,
    pub number_of_points: u16,
    #[serde(default)]
    pub unit: DeviceUnit,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAddress {
    pub device_code: String,
    pub device_number: u32,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Scattered word / double-word read (`device_read_random`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReadRandomList {
    #[serde(default)]
    pub word_devices: Vec<DeviceAddress>,
    #[serde(default)]
    pub dword_devices: Vec<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayLabel {
    pub name: String,
    pub unit: LabelUnit,
    /// Bits for [`LabelUnit::Bit`], bytes for [`LabelUnit::Byte`].
    pub array_length: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayLabelList {
    pub labels: Vec<ArrayLabel>,
    #[serde(default)]
    pub abbreviations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelReadRandomList {
    pub labels: Vec<String>,
    #[serde(default)]
    pub abbreviations: Vec<String>,
}

/// One configured SLMP request: `{ "function": ..., "addressList": {...} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", content = "addressList", rename_all = "snake_case")]
pub enum SlmpAttribute {
    DeviceRead(DeviceReadList),
    DeviceReadRandom(DeviceReadRandomList),
    ArrayLabelRead(ArrayLabelList),
    LabelReadRandom(LabelReadRandomList),
}

impl SlmpAttribute {
    pub fn function_name(&self) -> &'static str {
        match self {
            SlmpAttribute::DeviceRead(_) => "device_read",
            SlmpAttribute::DeviceReadRandom(_) => "device_read_random",
            SlmpAttribute::ArrayLabelRead(_) => "array_label_read",
            SlmpAttribute::LabelReadRandom(_) => "label_read_random",
        }
    }

    fn validate(&self, index: usize) -> Result<()> {
        let field = format!("slmp.attributes[{index}]");
        match self {
            SlmpAttribute::DeviceRead(list) => {
                require_text(&format!("{field}.deviceCode"), &list.device_code)?;
                let max = match list.unit {
                    DeviceUnit::Word => 960,
                    DeviceUnit::Bit => 7168,
                };
                if list.number_of_points == 0 || list.number_of_points > max {
                    return Err(ModelError::invalid(
                        format!("{field}.numberOfPoints"),
                        format!("must be in [1, {max}]"),
                    ));
                }
                if list.head_device > 0x00FF_FFFF {
                    return Err(ModelError::invalid(
                        format!("{field}.headDevice"),
                        "must fit in three bytes",
                    ));
                }
            }
            SlmpAttribute::DeviceReadRandom(list) => {
                let total = list.word_devices.len() + list.dword_devices.len();
                if total == 0 || total > 192 {
                    return Err(ModelError::invalid(
                        format!("{field}.addressList"),
                        "between 1 and 192 word/dword devices are required",
                    ));
                }
                for device in list.word_devices.iter().chain(&list.dword_devices) {
                    require_text(&format!("{field}.deviceCode"), &device.device_code)?;
                }
            }
            SlmpAttribute::ArrayLabelRead(list) => {
                if list.labels.is_empty() {
                    return Err(ModelError::invalid(
                        format!("{field}.labels"),
                        "at least one label is required",
                    ));
                }
                for label in &list.labels {
                    require_text(&format!("{field}.labels.name"), &label.name)?;
                    if label.array_length == 0 {
                        return Err(ModelError::invalid(
                            format!("{field}.labels.arrayLength"),
                            "must be at least 1",
                        ));
                    }
                }
            }
            SlmpAttribute::LabelReadRandom(list) => {
                if list.labels.is_empty() {
                    return Err(ModelError::invalid(
                        format!("{field}.labels"),
                        "at least one label is required",
                    ));
                }
                for label in &list.labels {
                    require_text(&format!("{field}.labels"), label)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlmpConfig {
    pub machine_ip: String,
    pub port_number: u16,
    pub ethernet: Ethernet,
    pub communication_code: CommunicationCode,
    pub network: u16,
    pub station: u16,
    /// Request destination module I/O number as hex text, e.g. `"03FF"`.
    pub module: String,
    pub multidrop: u16,
    /// Monitoring timer in milliseconds.
    pub timer: u32,
    pub subheader: Subheader,
    pub attributes: Vec<SlmpAttribute>,
    pub machine_query_iterations: u32,
    /// Seconds between poll starts.
    pub machine_query_time_interval: f64,
}

impl SlmpConfig {
    pub fn module_io(&self) -> Result<u16> {
        let text = self.module.trim();
        let text = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        u16::from_str_radix(text, 16)
            .map_err(|_| ModelError::invalid("slmp.module", "must be a hex string of at most four digits"))
    }

    /// Monitoring timer expressed in the protocol's 250 ms units, rounded up.
    pub fn timer_units(&self) -> u16 {
        let units = self.timer.div_ceil(250);
        u16::try_from(units).unwrap_or(u16::MAX)
    }
}

impl Validate for SlmpConfig {
    fn validate(&self) -> Result<()> {
        require_text("slmp.machineIp", &self.machine_ip)?;
        if self.port_number == 0 {
            return Err(ModelError::invalid("slmp.portNumber", "must not be zero"));
        }
        if self.network > 239 {
            return Err(ModelError::invalid("slmp.network", "must be in [0, 239]"));
        }
        if self.station > 120 && self.station != 255 {
            return Err(ModelError::invalid(
                "slmp.station",
                "must be in [0, 120] or 255",
            ));
        }
        if self.multidrop > 31 {
            return Err(ModelError::invalid("slmp.multidrop", "must be in [0, 31]"));
        }
        self.module_io()?;
        if self.attributes.is_empty() {
            return Err(ModelError::invalid(
                "slmp.attributes",
                "at least one attribute is required",
            ));
        }
        for (index, attribute) in self.attributes.iter().enumerate() {
            attribute.validate(index)?;
        }
        if self.machine_query_iterations < 1 {
            return Err(ModelError::invalid(
                "slmp.machineQueryIterations",
                "must be at least 1",
            ));
        }
        require_positive("slmp.machineQueryTimeInterval", self.machine_query_time_interval)
    }
}

// ---------------------------------------------------------------------------
// Modbus-TCP
// ---------------------------------------------------------------------------

/// Read commands a secondary may enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum ModbusCommand {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
}

impl ModbusCommand {
    pub fn function_code(self) -> u8 {
        match self {
            ModbusCommand::ReadCoils => 0x01,
            ModbusCommand::ReadDiscreteInputs => 0x02,
            ModbusCommand::ReadHoldingRegisters => 0x03,
            ModbusCommand::ReadInputRegisters => 0x04,
        }
    }

    pub fn is_bit_access(self) -> bool {
        matches!(self, ModbusCommand::ReadCoils | ModbusCommand::ReadDiscreteInputs)
    }

    pub fn max_count(self) -> u16 {
        if self.is_bit_access() {
            2000
        } else {
            125
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusReadSpec {
    pub address: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u16>,
}

impl ModbusReadSpec {
    /// Omitted counts read a single coil or register.
    pub fn count(&self) -> u16 {
        self.count.unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_coils: Option<ModbusReadSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_discrete_inputs: Option<ModbusReadSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_holding_registers: Option<ModbusReadSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_input_registers: Option<ModbusReadSpec>,
}

impl CommandConfig {
    /// Enabled commands in function-code order.
    pub fn enabled(&self) -> Vec<(ModbusCommand, ModbusReadSpec)> {
        [
            (ModbusCommand::ReadCoils, self.read_coils),
            (ModbusCommand::ReadDiscreteInputs, self.read_discrete_inputs),
            (ModbusCommand::ReadHoldingRegisters, self.read_holding_registers),
            (ModbusCommand::ReadInputRegisters, self.read_input_registers),
        ]
        .into_iter()
        .filter_map(|(command, spec)| spec.map(|spec| (command, spec)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryConfig {
    pub secondary_address: u8,
    pub frequency_in_seconds: f64,
    pub command_config: CommandConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusTcpConfig {
    pub host: String,
    pub host_port: u16,
    pub host_tag: String,
    pub modbus_secondaries_config: Vec<SecondaryConfig>,
}

impl ModbusTcpConfig {
    /// Shortest secondary frequency; the loop wakes at this cadence and each
    /// secondary is read when its own period has elapsed.
    pub fn base_interval(&self) -> f64 {
        self.modbus_secondaries_config
            .iter()
            .map(|secondary| secondary.frequency_in_seconds)
            .fold(f64::INFINITY, f64::min)
    }
}

impl Validate for ModbusTcpConfig {
    fn validate(&self) -> Result<()> {
        require_text("modbusTcp.host", &self.host)?;
        require_text("modbusTcp.hostTag", &self.host_tag)?;
        if self.modbus_secondaries_config.is_empty() {
            return Err(ModelError::invalid(
                "modbusTcp.modbusSecondariesConfig",
                "at least one secondary is required",
            ));
        }
        for secondary in &self.modbus_secondaries_config {
            let field = format!("modbusTcp.secondary[{}]", secondary.secondary_address);
            if secondary.secondary_address > 247 {
                return Err(ModelError::invalid(field, "secondaryAddress must be in [0, 247]"));
            }
            require_positive(&format!("{field}.frequencyInSeconds"), secondary.frequency_in_seconds)?;
            let commands = secondary.command_config.enabled();
            if commands.is_empty() {
                return Err(ModelError::invalid(
                    format!("{field}.commandConfig"),
                    "at least one command is required",
                ));
            }
            for (command, spec) in commands {
                let count = spec.count();
                if count == 0 || count > command.max_count() {
                    return Err(ModelError::invalid(
                        format!("{field}.{command}.count"),
                        format!("must be in [1, {}]", command.max_count()),
                    ));
                }
                if u32::from(spec.address) + u32::from(count) > 0x1_0000 {
                    return Err(ModelError::invalid(
                        format!("{field}.{command}.address"),
                        "address + count exceeds the 16-bit address space",
                    ));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OSI PI
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthMode {
    Basic,
    Kerberos,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsiPiConfig {
    pub api_url: String,
    pub server_name: String,
    #[serde(rename = "verifySSL", alias = "verifySsl", default = "default_true")]
    pub verify_ssl: bool,
    pub auth_mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_secret_arn: Option<String>,
    pub tags: Vec<String>,
    /// Seconds between reads once caught up.
    pub request_frequency: f64,
    /// Seconds between reads while catching up on a backlog.
    pub catchup_frequency: f64,
    /// Upper bound of one read window, in seconds.
    pub max_request_duration: f64,
    #[serde(default)]
    pub query_offset: f64,
}

impl Validate for OsiPiConfig {
    fn validate(&self) -> Result<()> {
        require_text("osiPi.apiUrl", &self.api_url)?;
        if !(self.api_url.starts_with("https://") || self.api_url.starts_with("http://")) {
            return Err(ModelError::invalid("osiPi.apiUrl", "must be an http(s) URL"));
        }
        require_text("osiPi.serverName", &self.server_name)?;
        if self.auth_mode == AuthMode::Basic
            && self
                .credential_secret_arn
                .as_deref()
                .map_or(true, |arn| arn.trim().is_empty())
        {
            return Err(ModelError::invalid(
                "osiPi.credentialSecretArn",
                "required when authMode is BASIC",
            ));
        }
        if self.tags.is_empty() {
            return Err(ModelError::invalid("osiPi.tags", "at least one tag is required"));
        }
        require_positive("osiPi.requestFrequency", self.request_frequency)?;
        require_positive("osiPi.catchupFrequency", self.catchup_frequency)?;
        require_positive("osiPi.maxRequestDuration", self.max_request_duration)?;
        if !self.query_offset.is_finite() || self.query_offset < 0.0 {
            return Err(ModelError::invalid("osiPi.queryOffset", "must be >= 0"));
        }
        Ok(())
    }
}
