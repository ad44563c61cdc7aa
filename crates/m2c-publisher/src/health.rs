//! ---
//! m2c_section: "09-integration-interoperability"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Periodic publisher health summary posted on the info topic."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::sink::SinkKind;

/// Cumulative routing counters since the publisher started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub routed: u64,
    pub sink_failures: BTreeMap<String, u64>,
    pub trailing: Option<u64>,
    pub primary: Option<u64>,
}

impl HealthReport {
    /// Body of the info reply.
    pub fn to_message(&self) -> Value {
        let mut message = serde_json::to_value(self).unwrap_or_default();
        if let Value::Object(fields) = &mut message {
            fields.insert("status".to_owned(), Value::from("publisher health"));
        }
        message
    }
}

#[derive(Debug)]
pub(crate) struct HealthTracker {
    interval: Duration,
    last_report: Instant,
    routed: u64,
    failures: BTreeMap<String, u64>,
}

impl HealthTracker {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_report: Instant::now(),
            routed: 0,
            failures: BTreeMap::new(),
        }
    }

    pub(crate) fn record_routed(&mut self) {
        self.routed += 1;
    }

    pub(crate) fn record_failure(&mut self, sink: SinkKind) {
        *self.failures.entry(sink.to_string()).or_default() += 1;
    }

    pub(crate) fn due(&self) -> bool {
        self.last_report.elapsed() >= self.interval
    }

    pub(crate) fn report(&mut self, trailing: Option<u64>, primary: Option<u64>) -> HealthReport {
        self.last_report = Instant::now();
        HealthReport {
            routed: self.routed,
            sink_failures: self.failures.clone(),
            trailing,
            primary,
        }
    }
}
