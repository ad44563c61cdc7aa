//! ---
//! m2c_section: "04-configuration-orchestration"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Iteration buffering and canonical record emission onto the local stream."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;
use m2c_logging::{m2c_debug, m2c_error, LogContext};
use m2c_metrics::ConnectorMetrics;
use m2c_model::{CanonicalRecord, DataPoint, LocationHierarchy};
use m2c_msg::Replier;
use m2c_persistence::LocalRecordStream;
use m2c_protocols::DeviceSample;
use serde_json::json;

/// Collects samples until `iterations` polls have completed.
#[derive(Debug, Clone)]
pub struct IterationBuffer {
    iterations: u32,
    completed: u32,
    samples: Vec<DeviceSample>,
}

impl IterationBuffer {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
            completed: 0,
            samples: Vec::new(),
        }
    }

    /// Add one poll result; returns the batch once the iteration target is met.
    pub fn push(&mut self, mut samples: Vec<DeviceSample>) -> Option<Vec<DeviceSample>> {
        self.samples.append(&mut samples);
        self.completed += 1;
        (self.completed >= self.iterations).then(|| self.take())
    }

    /// Drain whatever is buffered and restart the count.
    pub fn take(&mut self) -> Vec<DeviceSample> {
        self.completed = 0;
        std::mem::take(&mut self.samples)
    }

    /// Discard buffered samples after a failed poll.
    pub fn reset(&mut self) {
        self.completed = 0;
        self.samples.clear();
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Outcome of one emission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub appended: usize,
    pub dropped: usize,
    pub last_sequence: Option<u64>,
}

/// Turns grouped samples into canonical records and appends them.
#[derive(Debug, Clone)]
pub struct RecordEmitter {
    connection: String,
    location: LocationHierarchy,
    stream: Arc<LocalRecordStream>,
    metrics: Option<ConnectorMetrics>,
}

impl RecordEmitter {
    pub fn new(
        connection: impl Into<String>,
        location: LocationHierarchy,
        stream: Arc<LocalRecordStream>,
        metrics: Option<ConnectorMetrics>,
    ) -> Self {
        Self {
            connection: connection.into(),
            location,
            stream,
            metrics,
        }
    }

    pub fn stream(&self) -> &Arc<LocalRecordStream> {
        &self.stream
    }

    /// Group samples by tag in first-seen order, one record per tag. Points of
    /// a tag are ordered by timestamp; unreadable placeholders sort first.
    pub fn assemble(&self, samples: Vec<DeviceSample>) -> Vec<CanonicalRecord> {
        let mut by_tag: IndexMap<String, Vec<DataPoint>> = IndexMap::new();
        for sample in samples {
            let alias = self.location.alias(&sample.tag);
            let point = if sample.is_unreadable() {
                DataPoint::unreadable(alias)
            } else {
                DataPoint {
                    name: alias,
                    timestamp: sample.timestamp,
                    value: sample.value,
                    quality: sample.quality,
                }
            };
            by_tag.entry(sample.tag).or_default().push(point);
        }
        by_tag
            .into_iter()
            .map(|(tag, mut points)| {
                points.sort_by_key(DataPoint::instant);
                CanonicalRecord::with_messages(self.location.alias(&tag), points)
            })
            .collect()
    }

    /// Validate and append one record per tag. Invalid records are dropped
    /// with an error reply; append failures are logged and counted as drops.
    pub async fn emit(&self, samples: Vec<DeviceSample>, replier: &Replier) -> EmitReport {
        let mut report = EmitReport::default();
        if samples.is_empty() {
            return report;
        }
        for record in self.assemble(samples) {
            let tag = record.tag().to_owned();
            let ctx = LogContext::connection(&self.connection).with_tag(&tag);
            if let Err(err) = record.validate() {
                m2c_error!(context = ctx, "record dropped: {}", err);
                self.count_drop();
                report.dropped += 1;
                replier
                    .error(json!(format!("Record for {} dropped: {err}", record.alias)))
                    .await;
                continue;
            }
            let appended = record
                .to_bytes()
                .map_err(|err| err.to_string())
                .and_then(|bytes| self.stream.append(&bytes).map_err(|err| err.to_string()));
            match appended {
                Ok(sequence) => {
                    m2c_debug!(context = ctx.with_sequence(sequence), "record appended");
                    report.appended += 1;
                    report.last_sequence = Some(sequence);
                }
                Err(err) => {
                    m2c_error!(context = ctx, "failed to append record: {}", err);
                    self.count_drop();
                    report.dropped += 1;
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.add_emitted(&self.connection, report.appended as u64);
        }
        report
    }

    fn count_drop(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_dropped(&self.connection);
        }
    }
}
