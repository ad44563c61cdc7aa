//! ---
//! m2c_section: "02-messaging-ipc-data-model"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Canonical telemetry record and its invariants."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use m2c_common::parse_timestamp;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{ModelError, Result};

/// Value substituted for a point the OPC server could not read.
pub const UNREADABLE_VALUE: &str = "Parameters cannot be read from server";

/// Data quality. The six literal spellings are distinct values on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    Good,
    GoodUpper,
    Bad,
    BadUpper,
    Uncertain,
    UncertainUpper,
}

impl Quality {
    pub const ALL: [Quality; 6] = [
        Quality::Good,
        Quality::GoodUpper,
        Quality::Bad,
        Quality::BadUpper,
        Quality::Uncertain,
        Quality::UncertainUpper,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Good => "Good",
            Quality::GoodUpper => "GOOD",
            Quality::Bad => "Bad",
            Quality::BadUpper => "BAD",
            Quality::Uncertain => "Uncertain",
            Quality::UncertainUpper => "UNCERTAIN",
        }
    }

    /// Exact, case-sensitive match against the six literals.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|quality| quality.as_str() == raw)
    }

    /// Lenient mapping for quality strings reported by devices. Anything that is
    /// not recognisably good or uncertain is treated as bad.
    pub fn from_device(raw: &str) -> Self {
        if let Some(quality) = Self::parse(raw) {
            return quality;
        }
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered.starts_with("good") {
            Quality::Good
        } else if lowered.starts_with("uncertain") || lowered.starts_with("questionable") {
            Quality::Uncertain
        } else {
            Quality::Bad
        }
    }

    pub fn to_upper(self) -> Self {
        match self {
            Quality::Good | Quality::GoodUpper => Quality::GoodUpper,
            Quality::Bad | Quality::BadUpper => Quality::BadUpper,
            Quality::Uncertain | Quality::UncertainUpper => Quality::UncertainUpper,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw).ok_or_else(|| {
            ModelError::invalid(
                "quality",
                format!("`{raw}` is not one of Good, GOOD, Bad, BAD, Uncertain, UNCERTAIN"),
            )
        })
    }
}

impl Serialize for Quality {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One sample of a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
}

impl DataPoint {
    pub fn new(
        name: impl Into<String>,
        timestamp: impl Into<String>,
        value: Value,
        quality: Quality,
    ) -> Self {
        Self {
            name: name.into(),
            timestamp: Some(timestamp.into()),
            value,
            quality: Some(quality),
        }
    }

    /// Placeholder for a tag the server failed to read: no timestamp, no quality.
    pub fn unreadable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: None,
            value: Value::String(UNREADABLE_VALUE.to_owned()),
            quality: None,
        }
    }

    pub fn is_unreadable(&self) -> bool {
        self.timestamp.is_none()
            && self.quality.is_none()
            && self.value.as_str() == Some(UNREADABLE_VALUE)
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }
}

/// Invariant a record failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRule {
    EmptyMessages,
    NameMismatch { name: String },
    MissingTimestamp,
    UnparseableTimestamp { timestamp: String },
    MissingQuality,
    OutOfOrder,
}

impl fmt::Display for RecordRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRule::EmptyMessages => f.write_str("messages must not be empty"),
            RecordRule::NameMismatch { name } => {
                write!(f, "data point name `{name}` does not match the alias")
            }
            RecordRule::MissingTimestamp => f.write_str("data point has no timestamp"),
            RecordRule::UnparseableTimestamp { timestamp } => {
                write!(f, "timestamp `{timestamp}` is not an absolute instant")
            }
            RecordRule::MissingQuality => f.write_str("data point has no quality"),
            RecordRule::OutOfOrder => f.write_str("data points are not in timestamp order"),
        }
    }
}

/// Normalised `{alias, messages}` record appended to the local stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub alias: String,
    pub messages: Vec<DataPoint>,
}

impl CanonicalRecord {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            messages: Vec::new(),
        }
    }

    pub fn with_messages(alias: impl Into<String>, messages: Vec<DataPoint>) -> Self {
        Self {
            alias: alias.into(),
            messages,
        }
    }

    /// The tag segment of the alias (everything after the machine name).
    pub fn tag(&self) -> &str {
        self.alias.splitn(5, '/').nth(4).unwrap_or(&self.alias)
    }

    /// Check the record invariants: non-empty, names match the alias, every
    /// point carries a parseable timestamp and a quality (the unreadable
    /// placeholder excepted), timestamps non-decreasing.
    pub fn validate(&self) -> Result<()> {
        let fail = |rule| ModelError::InvalidRecord {
            alias: self.alias.clone(),
            rule,
        };
        if self.messages.is_empty() {
            return Err(fail(RecordRule::EmptyMessages));
        }
        let mut previous: Option<DateTime<Utc>> = None;
        for point in &self.messages {
            if point.name != self.alias {
                return Err(fail(RecordRule::NameMismatch {
                    name: point.name.clone(),
                }));
            }
            if point.is_unreadable() {
                continue;
            }
            let Some(raw) = point.timestamp.as_deref() else {
                return Err(fail(RecordRule::MissingTimestamp));
            };
            let Some(instant) = parse_timestamp(raw) else {
                return Err(fail(RecordRule::UnparseableTimestamp {
                    timestamp: raw.to_owned(),
                }));
            };
            if point.quality.is_none() {
                return Err(fail(RecordRule::MissingQuality));
            }
            if previous.is_some_and(|previous| instant < previous) {
                return Err(fail(RecordRule::OutOfOrder));
            }
            previous = Some(instant);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Partition key for stream sinks: `.` becomes `-` and `/` becomes `_`.
pub fn partition_key(tag: &str) -> String {
    tag.replace('.', "-").replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALIAS: &str = "site/area/process/machine/Random.Int4";

    fn good_point(timestamp: &str) -> DataPoint {
        DataPoint::new(ALIAS, timestamp, json!(27652.13), Quality::Good)
    }

    #[test]
    fn quality_literals_are_case_sensitive() {
        for quality in Quality::ALL {
            assert_eq!(Quality::parse(quality.as_str()), Some(quality));
        }
        assert_eq!(Quality::parse("good"), None);
        assert!("gOOD".parse::<Quality>().is_err());
        assert_eq!(Quality::from_device("good, non-specific"), Quality::Good);
        assert_eq!(Quality::from_device("Questionable"), Quality::Uncertain);
        assert_eq!(Quality::from_device("Sensor Failure"), Quality::Bad);
        assert_eq!(Quality::Uncertain.to_upper().as_str(), "UNCERTAIN");
    }

    #[test]
    fn happy_path_record_serializes_like_the_wire_format() {
        let record = CanonicalRecord::with_messages(
            ALIAS,
            vec![good_point("2021-06-03 15:14:21.247000+00:00")],
        );
        record.validate().unwrap();
        assert_eq!(record.tag(), "Random.Int4");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "alias": ALIAS,
                "messages": [{
                    "name": ALIAS,
                    "timestamp": "2021-06-03 15:14:21.247000+00:00",
                    "value": 27652.13,
                    "quality": "Good"
                }]
            })
        );
    }

    #[test]
    fn unreadable_point_carries_only_name_and_value() {
        let record = CanonicalRecord::with_messages(ALIAS, vec![DataPoint::unreadable(ALIAS)]);
        record.validate().unwrap();
        let value = serde_json::to_value(&record.messages[0]).unwrap();
        assert_eq!(
            value,
            json!({"name": ALIAS, "value": "Parameters cannot be read from server"})
        );
    }

    #[test]
    fn invariants_are_reported_by_rule() {
        let empty = CanonicalRecord::new(ALIAS);
        assert!(matches!(
            empty.validate(),
            Err(ModelError::InvalidRecord { rule: RecordRule::EmptyMessages, .. })
        ));

        let mut renamed = good_point("2021-06-03T15:14:21Z");
        renamed.name = "other".into();
        let record = CanonicalRecord::with_messages(ALIAS, vec![renamed]);
        assert!(matches!(
            record.validate(),
            Err(ModelError::InvalidRecord { rule: RecordRule::NameMismatch { .. }, .. })
        ));

        let record = CanonicalRecord::with_messages(ALIAS, vec![good_point("yesterday")]);
        assert!(matches!(
            record.validate(),
            Err(ModelError::InvalidRecord { rule: RecordRule::UnparseableTimestamp { .. }, .. })
        ));

        let mut unqualified = good_point("2021-06-03T15:14:21Z");
        unqualified.quality = None;
        let record = CanonicalRecord::with_messages(ALIAS, vec![unqualified]);
        assert!(matches!(
            record.validate(),
            Err(ModelError::InvalidRecord { rule: RecordRule::MissingQuality, .. })
        ));

        let record = CanonicalRecord::with_messages(
            ALIAS,
            vec![good_point("2021-06-03T15:14:22Z"), good_point("2021-06-03T15:14:21Z")],
        );
        assert!(matches!(
            record.validate(),
            Err(ModelError::InvalidRecord { rule: RecordRule::OutOfOrder, .. })
        ));
    }

    #[test]
    fn bad_quality_literal_fails_to_decode() {
        let payload = json!({
            "alias": ALIAS,
            "messages": [{"name": ALIAS, "timestamp": "2021-06-03T15:14:21Z", "value": 1, "quality": "good"}]
        });
        let err = CanonicalRecord::from_bytes(payload.to_string().as_bytes()).unwrap_err();
        assert!(err.to_string().contains("not one of"), "{err}");
    }

    #[test]
    fn partition_keys_are_sanitised() {
        assert_eq!(partition_key("Random.Int4"), "Random-Int4");
        assert_eq!(partition_key("a/b.c"), "a_b-c");
    }
}
