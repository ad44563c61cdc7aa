//! ---
//! m2c_section: "02-messaging-ipc-data-model"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Connection definition and control message parsing."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::str::FromStr;

use m2c_common::{ConnectionConfig, SinkFlags};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

use crate::protocol::{
    ModbusTcpConfig, OpcDaConfig, OsiPiConfig, ProtocolConfig, SlmpConfig, Validate,
};
use crate::{ModelError, Result};

/// Verb carried by every message on the job topic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ControlVerb {
    Start,
    Stop,
    Update,
    Push,
    Pull,
}

impl ControlVerb {
    /// `start`, `update` and `push` act on a full definition; `stop` and `pull`
    /// only name the connection.
    pub fn requires_definition(self) -> bool {
        matches!(self, ControlVerb::Start | ControlVerb::Update | ControlVerb::Push)
    }
}

/// Plant-floor protocol spoken by a connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[serde(rename = "opcda")]
    #[strum(to_string = "opcda", serialize = "opc-da")]
    OpcDa,
    #[serde(rename = "slmp")]
    #[strum(to_string = "slmp")]
    Slmp,
    #[serde(rename = "modbus-tcp")]
    #[strum(to_string = "modbus-tcp", serialize = "modbustcp")]
    ModbusTcp,
    #[serde(rename = "osipi")]
    #[strum(to_string = "osipi", serialize = "osi-pi")]
    OsiPi,
}

/// Site / area / process / machine path that prefixes every alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationHierarchy {
    pub site_name: String,
    pub area: String,
    pub process: String,
    pub machine_name: String,
}

impl LocationHierarchy {
    pub fn new(
        site_name: impl Into<String>,
        area: impl Into<String>,
        process: impl Into<String>,
        machine_name: impl Into<String>,
    ) -> Self {
        Self {
            site_name: site_name.into(),
            area: area.into(),
            process: process.into(),
            machine_name: machine_name.into(),
        }
    }

    /// `{siteName}/{area}/{process}/{machineName}/{tag}`.
    pub fn alias(&self, tag: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.site_name, self.area, self.process, self.machine_name, tag
        )
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("siteName", &self.site_name),
            ("area", &self.area),
            ("process", &self.process),
            ("machineName", &self.machine_name),
        ] {
            if value.trim().is_empty() {
                return Err(ModelError::invalid(field, "must not be empty"));
            }
        }
        Ok(())
    }
}

impl From<&ConnectionConfig> for LocationHierarchy {
    fn from(config: &ConnectionConfig) -> Self {
        Self::new(
            config.site_name.clone(),
            config.area.clone(),
            config.process.clone(),
            config.machine_name.clone(),
        )
    }
}

/// Wire shape of a definition: flat camelCase keys with one protocol block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDefinition {
    control: String,
    connection_name: String,
    protocol: String,
    #[serde(flatten)]
    location: LocationHierarchy,
    #[serde(flatten)]
    sinks: SinkFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    opc_da: Option<OpcDaConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    slmp: Option<SlmpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modbus_tcp: Option<ModbusTcpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    osi_pi: Option<OsiPiConfig>,
}

/// A validated connection definition.
///
/// Deserialization goes through the flat wire shape and rejects documents whose
/// protocol block is missing or out of range, so a value of this type is always
/// safe to persist and hand to a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDefinition", into = "RawDefinition")]
pub struct ConnectionDefinition {
    pub control: ControlVerb,
    pub connection_name: String,
    pub location: LocationHierarchy,
    pub sinks: SinkFlags,
    pub protocol: ProtocolConfig,
}

impl ConnectionDefinition {
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn protocol_kind(&self) -> Protocol {
        self.protocol.kind()
    }

    pub fn alias(&self, tag: &str) -> String {
        self.location.alias(tag)
    }

    /// Copy of this definition carrying a different control verb, used when the
    /// state file is rewritten on a transition.
    pub fn with_control(&self, control: ControlVerb) -> Self {
        Self {
            control,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.connection_name.trim();
        if name.is_empty() {
            return Err(ModelError::invalid("connectionName", "must not be empty"));
        }
        if name
            .chars()
            .any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace())
        {
            return Err(ModelError::invalid(
                "connectionName",
                "must not contain '/', '+', '#' or whitespace",
            ));
        }
        self.location.validate()?;
        self.protocol.validate()
    }
}

impl TryFrom<RawDefinition> for ConnectionDefinition {
    type Error = ModelError;

    fn try_from(raw: RawDefinition) -> Result<Self> {
        let control = ControlVerb::from_str(&raw.control)
            .map_err(|_| ModelError::UnknownVerb(raw.control.clone()))?;
        let kind = Protocol::from_str(&raw.protocol)
            .map_err(|_| ModelError::UnknownProtocol(raw.protocol.clone()))?;
        let protocol = match kind {
            Protocol::OpcDa => {
                ProtocolConfig::OpcDa(raw.opc_da.ok_or(ModelError::MissingField("opcDa"))?)
            }
            Protocol::Slmp => {
                ProtocolConfig::Slmp(raw.slmp.ok_or(ModelError::MissingField("slmp"))?)
            }
            Protocol::ModbusTcp => ProtocolConfig::ModbusTcp(
                raw.modbus_tcp
                    .ok_or(ModelError::MissingField("modbusTcp"))?,
            ),
            Protocol::OsiPi => {
                ProtocolConfig::OsiPi(raw.osi_pi.ok_or(ModelError::MissingField("osiPi"))?)
            }
        };
        let definition = ConnectionDefinition {
            control,
            connection_name: raw.connection_name,
            location: raw.location,
            sinks: raw.sinks,
            protocol,
        };
        definition.validate()?;
        Ok(definition)
    }
}

impl From<ConnectionDefinition> for RawDefinition {
    fn from(definition: ConnectionDefinition) -> Self {
        let mut raw = RawDefinition {
            control: definition.control.to_string(),
            connection_name: definition.connection_name,
            protocol: definition.protocol.kind().to_string(),
            location: definition.location,
            sinks: definition.sinks,
            opc_da: None,
            slmp: None,
            modbus_tcp: None,
            osi_pi: None,
        };
        match definition.protocol {
            ProtocolConfig::OpcDa(block) => raw.opc_da = Some(block),
            ProtocolConfig::Slmp(block) => raw.slmp = Some(block),
            ProtocolConfig::ModbusTcp(block) => raw.modbus_tcp = Some(block),
            ProtocolConfig::OsiPi(block) => raw.osi_pi = Some(block),
        }
        raw
    }
}

/// A decoded message from `m2c2/job/{connectionName}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub verb: ControlVerb,
    pub connection_name: String,
    pub definition: Option<ConnectionDefinition>,
}

impl ControlMessage {
    /// Decode a job payload. Unknown fields are ignored; the full definition is
    /// only required (and validated) for verbs that act on one.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        let object = value
            .as_object()
            .ok_or_else(|| ModelError::invalid("payload", "expected a JSON object"))?;
        let control = object
            .get("control")
            .and_then(Value::as_str)
            .ok_or(ModelError::MissingField("control"))?;
        let verb = ControlVerb::from_str(control)
            .map_err(|_| ModelError::UnknownVerb(control.to_owned()))?;
        let connection_name = object
            .get("connectionName")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .ok_or(ModelError::MissingField("connectionName"))?
            .to_owned();
        let definition = if verb.requires_definition() {
            Some(ConnectionDefinition::from_value(value)?)
        } else {
            None
        };
        Ok(Self {
            verb,
            connection_name,
            definition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opcda_json() -> Value {
        json!({
            "control": "start",
            "connectionName": "conn",
            "protocol": "opcda",
            "siteName": "site",
            "area": "area",
            "process": "process",
            "machineName": "machine",
            "sendDataToIoTTopic": true,
            "sendToHistorian": true,
            "opcDa": {
                "serverName": "Matrikon.OPC.Simulation.1",
                "machineIp": "10.0.0.5",
                "tags": ["Random.Int4"],
                "iterations": 1,
                "interval": 0.1
            },
            "someUnknownField": {"ignored": true}
        })
    }

    #[test]
    fn verbs_parse_case_insensitively() {
        assert_eq!("START".parse::<ControlVerb>().unwrap(), ControlVerb::Start);
        assert_eq!(ControlVerb::Pull.to_string(), "pull");
        assert!(ControlVerb::Push.requires_definition());
        assert!(!ControlVerb::Stop.requires_definition());
    }

    #[test]
    fn protocol_names_round_trip() {
        for protocol in [
            Protocol::OpcDa,
            Protocol::Slmp,
            Protocol::ModbusTcp,
            Protocol::OsiPi,
        ] {
            assert_eq!(protocol.to_string().parse::<Protocol>().unwrap(), protocol);
        }
        assert_eq!("modbus-tcp".parse::<Protocol>().unwrap(), Protocol::ModbusTcp);
    }

    #[test]
    fn definition_accepts_long_sink_names_and_ignores_unknown_fields() {
        let definition = ConnectionDefinition::from_value(opcda_json()).unwrap();
        assert_eq!(definition.protocol_kind(), Protocol::OpcDa);
        assert!(definition.sinks.send_to_iot_topic);
        assert!(definition.sinks.send_to_historian);
        assert!(!definition.sinks.send_to_kinesis);
        assert_eq!(
            definition.alias("Random.Int4"),
            "site/area/process/machine/Random.Int4"
        );
    }

    #[test]
    fn definition_round_trips_through_json() {
        let definition = ConnectionDefinition::from_value(opcda_json()).unwrap();
        let value = definition.to_value().unwrap();
        assert_eq!(value["opcDa"]["serverName"], "Matrikon.OPC.Simulation.1");
        assert!(value.get("slmp").is_none());
        let again = ConnectionDefinition::from_value(value).unwrap();
        assert_eq!(definition, again);
    }

    #[test]
    fn missing_protocol_block_is_rejected() {
        let mut value = opcda_json();
        value.as_object_mut().unwrap().remove("opcDa");
        let err = ConnectionDefinition::from_value(value).unwrap_err();
        assert!(err.to_string().contains("opcDa"), "{err}");
    }

    #[test]
    fn connection_name_must_be_topic_safe() {
        let mut value = opcda_json();
        value["connectionName"] = json!("a/b");
        assert!(ConnectionDefinition::from_value(value).is_err());
    }

    #[test]
    fn stop_message_needs_only_the_name() {
        let message = ControlMessage::parse(br#"{"control":"stop","connectionName":"conn"}"#)
            .unwrap();
        assert_eq!(message.verb, ControlVerb::Stop);
        assert_eq!(message.connection_name, "conn");
        assert!(message.definition.is_none());
    }

    #[test]
    fn start_message_requires_a_definition() {
        let err = ControlMessage::parse(br#"{"control":"start","connectionName":"conn"}"#)
            .unwrap_err();
        assert!(matches!(err, ModelError::Json(_)), "{err:?}");

        let payload = serde_json::to_vec(&opcda_json()).unwrap();
        let message = ControlMessage::parse(&payload).unwrap();
        assert!(message.definition.is_some());
    }

    #[test]
    fn control_errors_name_the_rule() {
        assert!(matches!(
            ControlMessage::parse(b"[1,2]"),
            Err(ModelError::InvalidField { .. })
        ));
        assert!(matches!(
            ControlMessage::parse(br#"{"connectionName":"c"}"#),
            Err(ModelError::MissingField("control"))
        ));
        assert!(matches!(
            ControlMessage::parse(br#"{"control":"restart","connectionName":"c"}"#),
            Err(ModelError::UnknownVerb(_))
        ));
        assert!(matches!(
            ControlMessage::parse(br#"{"control":"pull"}"#),
            Err(ModelError::MissingField("connectionName"))
        ));
        assert!(matches!(ControlMessage::parse(b"{"), Err(ModelError::Json(_))));
    }
}
