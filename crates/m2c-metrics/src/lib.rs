//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Metrics collection and export utilities."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across components.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get(move || metrics_handler(registry.clone())),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .context("failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> Response {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address the exporter is bound to (resolved when port 0 was requested).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "m2cd_starts_total",
            "Total number of times the M2C daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "m2cd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new("m2cd_build_info", "Build metadata for the running daemon binary"),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info.with_label_values(&[version, profile]).set(1);
    }
}

/// Per-connection polling metrics.
#[derive(Clone, Debug)]
pub struct ConnectorMetrics {
    polls: IntCounterVec,
    poll_errors: IntCounterVec,
    records_emitted: IntCounterVec,
    records_dropped: IntCounterVec,
    iteration_seconds: HistogramVec,
    connection_state: IntGaugeVec,
}

impl ConnectorMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let polls = IntCounterVec::new(
            Opts::new("m2c_polls_total", "Polling iterations started"),
            &["connection"],
        )?;
        registry.register(Box::new(polls.clone()))?;

        let poll_errors = IntCounterVec::new(
            Opts::new("m2c_poll_errors_total", "Polling iterations that failed"),
            &["connection"],
        )?;
        registry.register(Box::new(poll_errors.clone()))?;

        let records_emitted = IntCounterVec::new(
            Opts::new(
                "m2c_records_emitted_total",
                "Canonical records appended to the local stream",
            ),
            &["connection"],
        )?;
        registry.register(Box::new(records_emitted.clone()))?;

        let records_dropped = IntCounterVec::new(
            Opts::new(
                "m2c_records_dropped_total",
                "Canonical records rejected by validation",
            ),
            &["connection"],
        )?;
        registry.register(Box::new(records_dropped.clone()))?;

        let iteration_seconds = HistogramVec::new(
            HistogramOpts::new("m2c_iteration_seconds", "Duration of one polling iteration")
                .buckets(prometheus::exponential_buckets(0.001, 2.0, 14)?),
            &["connection"],
        )?;
        registry.register(Box::new(iteration_seconds.clone()))?;

        let connection_state = IntGaugeVec::new(
            Opts::new(
                "m2c_connection_state",
                "Connection state (0 idle, 1 connecting, 2 running, 3 reconnecting, 4 stopping)",
            ),
            &["connection"],
        )?;
        registry.register(Box::new(connection_state.clone()))?;

        Ok(Self {
            polls,
            poll_errors,
            records_emitted,
            records_dropped,
            iteration_seconds,
            connection_state,
        })
    }

    pub fn inc_poll(&self, connection: &str) {
        self.polls.with_label_values(&[connection]).inc();
    }

    pub fn inc_poll_error(&self, connection: &str) {
        self.poll_errors.with_label_values(&[connection]).inc();
    }

    pub fn add_emitted(&self, connection: &str, records: u64) {
        self.records_emitted
            .with_label_values(&[connection])
            .inc_by(records);
    }

    pub fn inc_dropped(&self, connection: &str) {
        self.records_dropped.with_label_values(&[connection]).inc();
    }

    pub fn observe_iteration(&self, connection: &str, seconds: f64) {
        self.iteration_seconds
            .with_label_values(&[connection])
            .observe(seconds);
    }

    pub fn set_state(&self, connection: &str, code: i64) {
        self.connection_state
            .with_label_values(&[connection])
            .set(code);
    }
}

/// Publisher routing metrics.
#[derive(Clone, Debug)]
pub struct PublisherMetrics {
    records_routed: IntCounter,
    sink_failures: IntCounterVec,
    trailing: IntGauge,
    primary: IntGauge,
}

impl PublisherMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let records_routed = IntCounter::with_opts(Opts::new(
            "m2c_records_routed_total",
            "Records read from the local stream and offered to every enabled sink",
        ))?;
        registry.register(Box::new(records_routed.clone()))?;

        let sink_failures = IntCounterVec::new(
            Opts::new("m2c_sink_failures_total", "Sink conversions or writes that failed"),
            &["sink"],
        )?;
        registry.register(Box::new(sink_failures.clone()))?;

        let trailing = IntGauge::with_opts(Opts::new(
            "m2c_publisher_trailing_sequence",
            "Highest sequence routed to all enabled sinks",
        ))?;
        registry.register(Box::new(trailing.clone()))?;

        let primary = IntGauge::with_opts(Opts::new(
            "m2c_publisher_primary_sequence",
            "Next sequence the publisher will read",
        ))?;
        registry.register(Box::new(primary.clone()))?;

        Ok(Self {
            records_routed,
            sink_failures,
            trailing,
            primary,
        })
    }

    pub fn inc_routed(&self) {
        self.records_routed.inc();
    }

    pub fn inc_sink_failure(&self, sink: &str) {
        self.sink_failures.with_label_values(&[sink]).inc();
    }

    pub fn set_checkpoints(&self, trailing: u64, primary: u64) {
        self.trailing.set(i64::try_from(trailing).unwrap_or(i64::MAX));
        self.primary.set(i64::try_from(primary).unwrap_or(i64::MAX));
    }
}

pub use prometheus;
