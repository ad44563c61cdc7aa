//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Prometheus handles for stream and checkpoint activity."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the persistence subsystem.
#[derive(Clone)]
pub struct PersistenceMetrics {
    bytes_appended: IntCounterVec,
    evicted: IntCounterVec,
    checkpoint_write: Histogram,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let bytes_appended = IntCounterVec::new(
            Opts::new(
                "m2c_stream_bytes_appended_total",
                "Bytes appended to local record streams, headers included",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(bytes_appended.clone()))?;

        let evicted = IntCounterVec::new(
            Opts::new(
                "m2c_stream_evicted_total",
                "Entries overwritten by stream capacity pressure",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(evicted.clone()))?;

        let checkpoint_write = Histogram::with_opts(
            HistogramOpts::new(
                "m2c_checkpoint_write_seconds",
                "Duration of durable checkpoint store rewrites",
            )
            .buckets(prometheus::exponential_buckets(0.0005, 2.0, 12)?),
        )?;
        registry.register(Box::new(checkpoint_write.clone()))?;

        Ok(Self {
            bytes_appended,
            evicted,
            checkpoint_write,
        })
    }

    /// Count bytes appended to a stream.
    pub fn record_appended(&self, stream: &str, bytes: u64) {
        self.bytes_appended.with_label_values(&[stream]).inc_by(bytes);
    }

    /// Count entries dropped from the front of a stream.
    pub fn record_evicted(&self, stream: &str, entries: u64) {
        self.evicted.with_label_values(&[stream]).inc_by(entries);
    }

    /// Observe one checkpoint rewrite.
    pub fn observe_checkpoint_write(&self, seconds: f64) {
        self.checkpoint_write.observe(seconds);
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exported() {
        let registry = Arc::new(Registry::new());
        let metrics = PersistenceMetrics::new(Arc::clone(&registry)).unwrap();
        metrics.record_appended("local", 120);
        metrics.record_evicted("local", 3);
        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"m2c_stream_bytes_appended_total".to_owned()));
        assert!(names.contains(&"m2c_stream_evicted_total".to_owned()));
    }
}
