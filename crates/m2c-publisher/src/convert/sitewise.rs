//! ---
//! m2c_section: "09-integration-interoperability"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Asset-model (SiteWise) property value conversion."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use m2c_common::time::seconds_and_nanos;
use m2c_model::{CanonicalRecord, DataPoint};
use serde_json::{json, Map, Value};

use crate::sink::SinkKind;
use crate::{PublisherError, Result};

/// Keys a boxed property value may use.
pub const SITEWISE_VALUE_KEYS: [&str; 4] =
    ["stringValue", "integerValue", "doubleValue", "booleanValue"];

/// One property-value entry per record. Unreadable placeholders carry no
/// timestamp and are skipped; `None` when nothing is left.
pub fn sitewise_entry(record: &CanonicalRecord) -> Result<Option<Value>> {
    let mut values = Vec::with_capacity(record.messages.len());
    for point in record.messages.iter().filter(|point| !point.is_unreadable()) {
        values.push(property_value(record, point)?);
    }
    if values.is_empty() {
        return Ok(None);
    }
    Ok(Some(json!({
        "propertyAlias": record.alias,
        "propertyValues": values,
    })))
}

fn property_value(record: &CanonicalRecord, point: &DataPoint) -> Result<Value> {
    let fail = |reason: String| PublisherError::Conversion {
        sink: SinkKind::SiteWise,
        alias: record.alias.clone(),
        reason,
    };
    let instant = point
        .instant()
        .ok_or_else(|| fail(format!("timestamp {:?} is not parseable", point.timestamp)))?;
    let quality = point
        .quality
        .ok_or_else(|| fail("data point has no quality".to_owned()))?;
    let (seconds, nanos) = seconds_and_nanos(instant);
    Ok(json!({
        "value": boxed(&point.value).map_err(fail)?,
        "timestamp": {"timeInSeconds": seconds, "offsetInNanos": nanos},
        "quality": quality.to_upper().as_str(),
    }))
}

fn boxed(value: &Value) -> std::result::Result<Value, String> {
    let (key, inner) = match value {
        Value::String(text) => ("stringValue", Value::from(text.as_str())),
        Value::Bool(flag) => ("booleanValue", Value::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => ("integerValue", Value::from(integer)),
            None => ("doubleValue", Value::from(number.as_f64().unwrap_or(f64::NAN))),
        },
        other => return Err(format!("unsupported value type {}", type_name(other))),
    };
    let mut map = Map::with_capacity(1);
    map.insert(key.to_owned(), inner);
    Ok(Value::Object(map))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2c_model::Quality;

    const ALIAS: &str = "site/area/process/machine/Random.Int4";

    fn record(values: Vec<Value>) -> CanonicalRecord {
        CanonicalRecord::with_messages(
            ALIAS,
            values
                .into_iter()
                .map(|value| DataPoint::new(ALIAS, "2021-06-03T15:14:21.250Z", value, Quality::Good))
                .collect(),
        )
    }

    #[test]
    fn scalars_are_boxed_by_type() {
        let entry = sitewise_entry(&record(vec![
            json!("on"),
            json!(7),
            json!(1.5),
            json!(true),
        ]))
        .unwrap()
        .unwrap();
        let values = entry["propertyValues"].as_array().unwrap();
        assert_eq!(entry["propertyAlias"], ALIAS);
        assert_eq!(values[0]["value"]["stringValue"], "on");
        assert_eq!(values[1]["value"]["integerValue"], 7);
        assert_eq!(values[2]["value"]["doubleValue"], 1.5);
        assert_eq!(values[3]["value"]["booleanValue"], true);
        assert_eq!(values[0]["quality"], "GOOD");
        assert_eq!(values[0]["timestamp"]["timeInSeconds"], 1_622_733_261);
        assert_eq!(values[0]["timestamp"]["offsetInNanos"], 250_000_000);
    }

    #[test]
    fn structured_values_are_rejected() {
        let err = sitewise_entry(&record(vec![json!([1, 2])])).unwrap_err();
        assert!(matches!(err, PublisherError::Conversion { sink: SinkKind::SiteWise, .. }));
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn unreadable_only_records_produce_nothing() {
        let record = CanonicalRecord::with_messages(ALIAS, vec![DataPoint::unreadable(ALIAS)]);
        assert!(sitewise_entry(&record).unwrap().is_none());
    }
}
