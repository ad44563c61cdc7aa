//! ---
//! m2c_section: "09-integration-interoperability"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Checkpointed read loop routing local stream records to the sinks."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use m2c_common::config::{PublisherConfig, RuntimeConfig};
use m2c_logging::{m2c_error, m2c_info, m2c_warn, LogContext};
use m2c_metrics::PublisherMetrics;
use m2c_model::{CanonicalRecord, LocationHierarchy};
use m2c_msg::{MessageBus, Replier};
use m2c_persistence::{
    CheckpointKind, CheckpointStore, LocalRecordStream, PersistenceError, PersistenceMetrics,
    StreamStore, CHECKPOINT_FILE_NAME,
};
use tokio::sync::broadcast;

use crate::convert::ConversionContext;
use crate::health::{HealthReport, HealthTracker};
use crate::sink::{IotTopicSink, Sink, SinkKind, StreamSink};
use crate::Result;

/// Timing knobs of the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherSettings {
    /// Wait for an append when the cursor is at the tail.
    pub idle_backoff: Duration,
    pub health_interval: Duration,
    /// Deadline for one sink to accept one record; an expired deadline counts
    /// as a failure of that sink.
    pub sink_timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self::from(&PublisherConfig::default())
    }
}

impl From<&PublisherConfig> for PublisherSettings {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            idle_backoff: config.idle_backoff,
            health_interval: config.health_interval,
            sink_timeout: config.sink_timeout,
        }
    }
}

/// Reads the local record stream in sequence order and offers every record to
/// each enabled sink.
///
/// After a record has been handed to all sinks, `trailing` becomes its
/// sequence and `primary` the next one, in one durable write. A crash can
/// therefore replay at most the record that was being routed.
pub struct Publisher {
    stream: Arc<LocalRecordStream>,
    checkpoints: CheckpointStore,
    sinks: Vec<Box<dyn Sink>>,
    replier: Replier,
    settings: PublisherSettings,
    metrics: Option<PublisherMetrics>,
    health: HealthTracker,
    cursor: u64,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("stream", &self.stream.name())
            .field("sinks", &self.sink_kinds())
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Publisher {
    /// Build a publisher and compute its resume cursor from the checkpoints.
    pub fn new(
        stream: Arc<LocalRecordStream>,
        checkpoints: CheckpointStore,
        sinks: Vec<Box<dyn Sink>>,
        replier: Replier,
        settings: PublisherSettings,
        metrics: Option<PublisherMetrics>,
    ) -> Result<Self> {
        let mut publisher = Self {
            stream,
            checkpoints,
            sinks,
            replier,
            settings,
            metrics,
            health: HealthTracker::new(settings.health_interval),
            cursor: 0,
        };
        publisher.cursor = publisher.resume_cursor()?;
        Ok(publisher)
    }

    /// Wire the local stream, checkpoint store and enabled sinks from the
    /// runtime configuration. Export streams live in the same store.
    pub fn from_config(
        config: &RuntimeConfig,
        streams: &StreamStore,
        bus: Arc<dyn MessageBus>,
        metrics: Option<PublisherMetrics>,
        persistence_metrics: Option<PersistenceMetrics>,
    ) -> Result<Self> {
        let connection = &config.connection;
        let location = LocationHierarchy::new(
            &connection.site_name,
            &connection.area,
            &connection.process,
            &connection.machine_name,
        );
        let context = ConversionContext::new(
            &connection.name,
            location.clone(),
            config
                .streams
                .collector_id
                .clone()
                .unwrap_or_else(|| connection.name.clone()),
        );

        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        if config.sinks.send_to_iot_topic {
            sinks.push(Box::new(IotTopicSink::new(bus.clone(), context.clone())));
        }
        let exports = [
            (config.sinks.send_to_kinesis, SinkKind::Kinesis, &config.streams.kinesis_stream),
            (config.sinks.send_to_timestream, SinkKind::Timestream, &config.streams.timestream_stream),
            (config.sinks.send_to_historian, SinkKind::Historian, &config.streams.historian_stream),
            (config.sinks.send_to_sitewise, SinkKind::SiteWise, &config.streams.sitewise_stream),
        ];
        for (enabled, kind, name) in exports {
            if !enabled {
                continue;
            }
            let name = name
                .clone()
                .unwrap_or_else(|| format!("m2c2_{}_{}", connection.name, kind));
            sinks.push(Box::new(StreamSink::new(kind, streams.open_stream(&name)?, context.clone())));
        }

        let stream = streams.open_stream(&config.local_stream_name())?;
        let checkpoints = CheckpointStore::open(
            config.publisher_dir().join(CHECKPOINT_FILE_NAME),
            persistence_metrics,
        )?;
        Self::new(
            stream,
            checkpoints,
            sinks,
            Replier::new(bus, connection.name.clone(), location),
            PublisherSettings::from(&config.publisher),
            metrics,
        )
    }

    /// Next sequence to read.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn sink_kinds(&self) -> Vec<SinkKind> {
        self.sinks.iter().map(|sink| sink.kind()).collect()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    fn context(&self) -> LogContext<'_> {
        LogContext::connection(self.replier.connection())
    }

    /// Resume after `trailing` when set (rewriting `primary` to match), else at
    /// `primary`, else at the oldest retained record.
    fn resume_cursor(&self) -> Result<u64> {
        let name = self.stream.name();
        let trailing = self.checkpoints.get(name, CheckpointKind::Trailing);
        let primary = self.checkpoints.get(name, CheckpointKind::Primary);
        let cursor = match (trailing, primary) {
            (Some(trailing), _) => {
                let cursor = trailing.saturating_add(1);
                if primary != Some(cursor) {
                    self.checkpoints.set(name, CheckpointKind::Primary, cursor)?;
                }
                cursor
            }
            (None, Some(primary)) => primary,
            (None, None) => self
                .stream
                .oldest_sequence()
                .unwrap_or_else(|| self.stream.next_sequence()),
        };
        m2c_info!(
            context = self.context(),
            "resuming {} at sequence {} (trailing {:?}, primary {:?})",
            name,
            cursor,
            trailing,
            primary
        );
        Ok(cursor)
    }

    /// Route the record at the cursor. Returns `false` when the cursor is at
    /// the tail and there is nothing to read yet.
    pub async fn step(&mut self) -> Result<bool> {
        let sequence = self.cursor;
        match self.stream.read(sequence) {
            Ok(payload) => {
                self.route(sequence, &payload).await;
                self.commit(sequence)?;
                self.cursor = sequence + 1;
                Ok(true)
            }
            Err(PersistenceError::NotYetAvailable { .. }) => Ok(false),
            Err(PersistenceError::Evicted { oldest, .. }) => {
                m2c_warn!(
                    context = self.context().with_sequence(sequence),
                    "records {}..{} were overwritten before routing, skipping ahead",
                    sequence,
                    oldest
                );
                self.checkpoints
                    .set(self.stream.name(), CheckpointKind::Primary, oldest)?;
                self.cursor = oldest;
                Ok(true)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Offer one record to every sink. Sink failures are logged and counted;
    /// they never stop the other sinks or the cursor.
    async fn route(&mut self, sequence: u64, payload: &[u8]) {
        let record = match CanonicalRecord::from_bytes(payload) {
            Ok(record) => record,
            Err(err) => {
                m2c_error!(
                    context = self.context().with_sequence(sequence),
                    "skipping undecodable record: {}",
                    err
                );
                return;
            }
        };
        let ctx = LogContext::connection(self.replier.connection())
            .with_sequence(sequence)
            .with_tag(record.tag());
        let deadline = self.settings.sink_timeout;
        for sink in &self.sinks {
            let kind = sink.kind();
            match tokio::time::timeout(deadline, sink.deliver(record.clone())).await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => m2c_error!(context = ctx, "{} sink failed: {}", kind, err),
                Err(_) => m2c_error!(
                    context = ctx,
                    "{} sink did not accept the record within {:?}",
                    kind,
                    deadline
                ),
            }
            self.health.record_failure(kind);
            if let Some(metrics) = &self.metrics {
                metrics.inc_sink_failure(kind.as_ref());
            }
        }
        self.health.record_routed();
        if let Some(metrics) = &self.metrics {
            metrics.inc_routed();
        }
    }

    fn commit(&self, sequence: u64) -> Result<()> {
        let primary = sequence + 1;
        self.checkpoints.commit(
            self.stream.name(),
            &[
                (CheckpointKind::Trailing, sequence),
                (CheckpointKind::Primary, primary),
            ],
        )?;
        if let Some(metrics) = &self.metrics {
            metrics.set_checkpoints(sequence, primary);
        }
        Ok(())
    }

    /// Post the health summary on the info topic.
    pub async fn report_health(&mut self) -> HealthReport {
        let name = self.stream.name();
        let report = self.health.report(
            self.checkpoints.get(name, CheckpointKind::Trailing),
            self.checkpoints.get(name, CheckpointKind::Primary),
        );
        self.replier.info(report.to_message()).await;
        report
    }

    /// Route records until `shutdown` fires. The record being routed when the
    /// signal arrives is finished and checkpointed first.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        m2c_info!(
            context = self.context(),
            "publishing {} from sequence {} to {:?}",
            self.stream.name(),
            self.cursor,
            self.sink_kinds()
        );
        loop {
            if !matches!(
                shutdown.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            ) {
                break;
            }
            let advanced = self.step().await?;
            if self.health.due() {
                self.report_health().await;
            }
            if !advanced {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = self.stream.wait_for_append(self.settings.idle_backoff) => {}
                }
            }
        }
        m2c_info!(
            context = self.context(),
            "publisher stopped before sequence {}",
            self.cursor
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2c_model::{DataPoint, Quality};
    use m2c_msg::InMemoryBus;
    use m2c_persistence::StreamOptions;
    use serde_json::json;

    fn record(value: i64) -> Vec<u8> {
        let alias = "site/area/process/machine/Random.Int4";
        CanonicalRecord::with_messages(
            alias,
            vec![DataPoint::new(alias, "2021-06-03T15:14:21Z", json!(value), Quality::Good)],
        )
        .to_bytes()
        .unwrap()
    }

    fn publisher(dir: &std::path::Path, stream: Arc<LocalRecordStream>) -> Publisher {
        let bus = Arc::new(InMemoryBus::new());
        let location = LocationHierarchy::new("site", "area", "process", "machine");
        let context = ConversionContext::new("conn", location.clone(), "collector");
        Publisher::new(
            stream,
            CheckpointStore::open(dir.join("checkpoints"), None).unwrap(),
            vec![Box::new(IotTopicSink::new(bus.clone(), context))],
            Replier::new(bus, "conn", location),
            PublisherSettings::default(),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fresh_publisher_starts_at_the_oldest_record() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Arc::new(
            LocalRecordStream::open(dir.path(), "local", StreamOptions::new(1 << 20, 1 << 16), None)
                .unwrap(),
        );
        stream.append(&record(1)).unwrap();
        let mut publisher = publisher(dir.path(), stream.clone());
        assert_eq!(publisher.cursor(), 0);
        assert!(publisher.step().await.unwrap());
        assert!(!publisher.step().await.unwrap());
        assert_eq!(
            publisher.checkpoints().get("local", CheckpointKind::Trailing),
            Some(0)
        );
        assert_eq!(
            publisher.checkpoints().get("local", CheckpointKind::Primary),
            Some(1)
        );
    }

    #[tokio::test]
    async fn evicted_cursor_jumps_to_the_oldest_record() {
        let dir = tempfile::tempdir().unwrap();
        // one record per segment, two segments retained
        let stream = Arc::new(
            LocalRecordStream::open(dir.path(), "local", StreamOptions::new(512, 256), None)
                .unwrap(),
        );
        let mut publisher = publisher(dir.path(), stream.clone());
        assert_eq!(publisher.cursor(), 0);
        for value in 0..5 {
            stream.append(&record(value)).unwrap();
        }
        assert_eq!(stream.oldest_sequence(), Some(3));

        assert!(publisher.step().await.unwrap());
        assert_eq!(publisher.cursor(), 3);
        assert_eq!(
            publisher.checkpoints().get("local", CheckpointKind::Primary),
            Some(3)
        );
        assert!(publisher.step().await.unwrap());
        assert!(publisher.step().await.unwrap());
        assert!(!publisher.step().await.unwrap());
        assert_eq!(
            publisher.checkpoints().get("local", CheckpointKind::Trailing),
            Some(4)
        );
    }
}
