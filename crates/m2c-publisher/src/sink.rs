//! ---
//! m2c_section: "09-integration-interoperability"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Sink destinations: the IoT data topic and the export streams."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use m2c_model::{partition_key, CanonicalRecord};
use m2c_msg::MessageBus;
use m2c_persistence::LocalRecordStream;
use serde_json::{json, Value};
use strum::{AsRefStr, Display};

use crate::convert::{
    historian_records, inline_hierarchy, iot_message, sitewise_entry, timestream_records,
    ConversionContext,
};
use crate::Result;

/// The five downstream destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum SinkKind {
    IotTopic,
    Kinesis,
    Timestream,
    Historian,
    #[strum(serialize = "sitewise")]
    SiteWise,
}

/// A destination the publisher offers every record to.
#[async_trait]
pub trait Sink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Convert and hand over one record. The sink owns its copy.
    async fn deliver(&self, record: CanonicalRecord) -> Result<()>;
}

/// Publishes on `m2c2/data/{connection}/{machine}/{tag}`.
pub struct IotTopicSink {
    bus: Arc<dyn MessageBus>,
    context: ConversionContext,
}

impl IotTopicSink {
    pub fn new(bus: Arc<dyn MessageBus>, context: ConversionContext) -> Self {
        Self { bus, context }
    }
}

#[async_trait]
impl Sink for IotTopicSink {
    fn kind(&self) -> SinkKind {
        SinkKind::IotTopic
    }

    async fn deliver(&self, record: CanonicalRecord) -> Result<()> {
        let (topic, payload) = iot_message(&record, &self.context);
        self.bus.publish(&topic, serde_json::to_vec(&payload)?).await?;
        Ok(())
    }
}

/// Appends converted payloads to a named export stream. Each entry is
/// `{partitionKey, data}` so an uploader can keep per-tag ordering.
pub struct StreamSink {
    kind: SinkKind,
    stream: Arc<LocalRecordStream>,
    context: ConversionContext,
}

impl StreamSink {
    pub fn new(kind: SinkKind, stream: Arc<LocalRecordStream>, context: ConversionContext) -> Self {
        Self {
            kind,
            stream,
            context,
        }
    }

    pub fn stream(&self) -> &Arc<LocalRecordStream> {
        &self.stream
    }

    fn payloads(&self, record: &CanonicalRecord) -> Result<Vec<Value>> {
        Ok(match self.kind {
            SinkKind::IotTopic | SinkKind::Kinesis => vec![inline_hierarchy(record, &self.context)],
            SinkKind::Timestream => timestream_records(record, &self.context)?,
            SinkKind::Historian => historian_records(record, &self.context, Utc::now())?,
            SinkKind::SiteWise => sitewise_entry(record)?.into_iter().collect(),
        })
    }
}

#[async_trait]
impl Sink for StreamSink {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    async fn deliver(&self, record: CanonicalRecord) -> Result<()> {
        let key = partition_key(record.tag());
        for payload in self.payloads(&record)? {
            let entry = json!({"partitionKey": key, "data": payload});
            self.stream.append(&serde_json::to_vec(&entry)?)?;
        }
        Ok(())
    }
}
