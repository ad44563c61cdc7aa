//! ---
//! m2c_section: "09-integration-interoperability"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Pure converters from canonical records to sink payloads."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
//! Every converter takes the record by reference and returns a fresh payload,
//! so one record can be offered to several sinks without copies leaking
//! mutations between them.

mod flat;
mod sitewise;

pub use flat::{historian_records, timestream_records};
pub use sitewise::{sitewise_entry, SITEWISE_VALUE_KEYS};

use m2c_model::{CanonicalRecord, LocationHierarchy};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::Result;

/// Connection facts every converter needs besides the record itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionContext {
    pub connection: String,
    pub location: LocationHierarchy,
    /// Historian collector identifier.
    pub collector_id: String,
}

impl ConversionContext {
    pub fn new(
        connection: impl Into<String>,
        location: LocationHierarchy,
        collector_id: impl Into<String>,
    ) -> Self {
        Self {
            connection: connection.into(),
            location,
            collector_id: collector_id.into(),
        }
    }
}

/// Canonical record with the location hierarchy and the tag inlined. This is
/// the IoT-topic payload and the Kinesis passthrough body.
pub fn inline_hierarchy(record: &CanonicalRecord, ctx: &ConversionContext) -> Value {
    json!({
        "siteName": ctx.location.site_name,
        "area": ctx.location.area,
        "process": ctx.location.process,
        "machineName": ctx.location.machine_name,
        "tag": record.tag(),
        "alias": record.alias,
        "messages": record.messages,
    })
}

/// Topic and payload for the IoT-topic sink.
pub fn iot_message(record: &CanonicalRecord, ctx: &ConversionContext) -> (String, Value) {
    let topic = m2c_msg::data_topic(&ctx.connection, &ctx.location.machine_name, record.tag());
    (topic, inline_hierarchy(record, ctx))
}

/// Recover the canonical record from an inlined payload; the hierarchy fields
/// are ignored.
pub fn record_from_inlined(payload: &Value) -> Result<CanonicalRecord> {
    #[derive(Deserialize)]
    struct Inlined {
        alias: String,
        messages: Vec<m2c_model::DataPoint>,
    }
    let inlined = Inlined::deserialize(payload)?;
    Ok(CanonicalRecord::with_messages(inlined.alias, inlined.messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2c_model::{DataPoint, Quality};

    fn context() -> ConversionContext {
        ConversionContext::new(
            "conn",
            LocationHierarchy::new("site", "area", "process", "machine"),
            "collector-1",
        )
    }

    #[test]
    fn iot_payload_inlines_the_hierarchy_and_round_trips() {
        let alias = "site/area/process/machine/Random.Int4";
        let record = CanonicalRecord::with_messages(
            alias,
            vec![
                DataPoint::new(alias, "2021-06-03T15:14:21.000Z", json!(27652.13), Quality::Good),
                DataPoint::unreadable(alias),
            ],
        );
        let (topic, payload) = iot_message(&record, &context());
        assert_eq!(topic, "m2c2/data/conn/machine/Random.Int4");
        assert_eq!(payload["siteName"], "site");
        assert_eq!(payload["machineName"], "machine");
        assert_eq!(payload["tag"], "Random.Int4");
        assert_eq!(payload["messages"][0]["quality"], "Good");
        assert_eq!(record_from_inlined(&payload).unwrap(), record);
    }
}
