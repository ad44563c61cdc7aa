//! ---
//! m2c_section: "09-integration-interoperability"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Per-point flat records for the time-series and historian streams."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use m2c_common::time::epoch_millis;
use m2c_model::{CanonicalRecord, DataPoint, Quality};
use serde_json::{json, Value};

use super::ConversionContext;
use crate::sink::SinkKind;
use crate::{PublisherError, Result};

/// One `{site, area, process, machine, tag, quality, timestamp, value}` record
/// per readable data point, `timestamp` in epoch milliseconds.
pub fn timestream_records(record: &CanonicalRecord, ctx: &ConversionContext) -> Result<Vec<Value>> {
    readable(record, SinkKind::Timestream)?
        .into_iter()
        .map(|(point, quality)| {
            let instant = point.instant().ok_or_else(|| PublisherError::Conversion {
                sink: SinkKind::Timestream,
                alias: record.alias.clone(),
                reason: format!("timestamp {:?} is not parseable", point.timestamp),
            })?;
            Ok(json!({
                "site": ctx.location.site_name,
                "area": ctx.location.area,
                "process": ctx.location.process,
                "machine": ctx.location.machine_name,
                "tag": record.tag(),
                "quality": quality.as_str(),
                "timestamp": epoch_millis(instant),
                "value": point.value,
            }))
        })
        .collect()
}

/// One historian measurement per readable data point. The timestamp is the
/// conversion instant, not the device timestamp.
pub fn historian_records(
    record: &CanonicalRecord,
    ctx: &ConversionContext,
    now: DateTime<Utc>,
) -> Result<Vec<Value>> {
    let tag = record.tag();
    Ok(readable(record, SinkKind::Historian)?
        .into_iter()
        .map(|(point, quality)| {
            json!({
                "@type": "data",
                "sourceId": ctx.connection,
                "collectorId": ctx.collector_id,
                "measurementId": tag,
                "measureName": tag,
                "timestamp": epoch_millis(now),
                "value": point.value,
                "measureQuality": quality.as_str(),
            })
        })
        .collect())
}

fn readable(record: &CanonicalRecord, sink: SinkKind) -> Result<Vec<(&DataPoint, Quality)>> {
    record
        .messages
        .iter()
        .filter(|point| !point.is_unreadable())
        .map(|point| {
            let quality = point.quality.ok_or_else(|| PublisherError::Conversion {
                sink,
                alias: record.alias.clone(),
                reason: "data point has no quality".to_owned(),
            })?;
            Ok((point, quality))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use m2c_model::LocationHierarchy;

    const ALIAS: &str = "site/area/process/machine/Random.Int4";

    fn context() -> ConversionContext {
        ConversionContext::new(
            "conn",
            LocationHierarchy::new("site", "area", "process", "machine"),
            "collector-1",
        )
    }

    fn record() -> CanonicalRecord {
        CanonicalRecord::with_messages(
            ALIAS,
            vec![
                DataPoint::unreadable(ALIAS),
                DataPoint::new(ALIAS, "2021-06-03T15:14:21.000Z", json!(1.5), Quality::Good),
                DataPoint::new(ALIAS, "2021-06-03T15:14:22.000Z", json!(2.5), Quality::BadUpper),
            ],
        )
    }

    #[test]
    fn timestream_flattens_each_readable_point() {
        let rows = timestream_records(&record(), &context()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            json!({
                "site": "site",
                "area": "area",
                "process": "process",
                "machine": "machine",
                "tag": "Random.Int4",
                "quality": "Good",
                "timestamp": 1_622_733_261_000_i64,
                "value": 1.5,
            })
        );
        assert_eq!(rows[1]["quality"], "BAD");
    }

    #[test]
    fn historian_uses_the_conversion_clock() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let rows = historian_records(&record(), &context(), now).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["@type"], "data");
        assert_eq!(rows[0]["sourceId"], "conn");
        assert_eq!(rows[0]["collectorId"], "collector-1");
        assert_eq!(rows[0]["measurementId"], "Random.Int4");
        assert_eq!(rows[0]["measureName"], "Random.Int4");
        assert_eq!(rows[0]["timestamp"], now.timestamp_millis());
        assert_eq!(rows[1]["measureQuality"], "BAD");
    }
}
