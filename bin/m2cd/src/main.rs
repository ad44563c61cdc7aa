//! ---
//! m2c_section: "01-core-functionality"
//! m2c_subsection: "binary"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Binary entrypoint for the M2C daemon."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use m2c_common::config::RuntimeConfig;
use m2c_common::logging::init_tracing;
use m2c_connector::{Connector, ConnectorSettings, ProtocolDriverFactory};
use m2c_metrics::{
    new_registry, spawn_http_server, ConnectorMetrics, DaemonMetrics, PublisherMetrics,
};
use m2c_model::LocationHierarchy;
use m2c_msg::{job_topic, MessageBus, MqttBus};
use m2c_persistence::{
    CheckpointKind, CheckpointStore, ConnectionStateStore, PersistenceMetrics, StreamOptions,
    StreamStore, CHECKPOINT_FILE_NAME,
};
use m2c_publisher::Publisher;
use m2c_rt::TaskSet;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "M2C edge connector daemon", long_about = None)]
struct Cli {
    #[arg(
        long,
        value_name = "FILE",
        env = "M2C_CONFIG",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the connector and publisher for the configured connection")]
    Run,
    #[command(about = "Load and validate the configuration, then print it")]
    CheckConfig,
    #[command(about = "Print local stream bounds and publisher checkpoints")]
    InspectStream,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let load_started = Instant::now();
    let config = RuntimeConfig::load(cli.config.as_deref())?;
    let load_duration = load_started.elapsed();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("m2cd", &config.logging)?;
            info!(connection = %config.connection.name, "configuration loaded");
            run_daemon(config, load_duration).await?
        }
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::InspectStream => inspect_stream(&config)?,
    }

    Ok(())
}

async fn run_daemon(config: RuntimeConfig, load_duration: Duration) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&registry)?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let persistence_metrics = PersistenceMetrics::new(registry.clone())?;
    let streams = StreamStore::new(
        config.stream_root(),
        StreamOptions::new(config.streams.max_bytes, config.streams.segment_bytes),
        Some(persistence_metrics.clone()),
    );
    let local = streams.open_stream(&config.local_stream_name())?;

    let connection = &config.connection;
    let mqtt = Arc::new(MqttBus::connect(
        &config.mqtt,
        &format!("m2cd-{}", connection.name),
        config.control.subscribe_timeout,
    ));
    let bus: Arc<dyn MessageBus> = mqtt.clone();

    let connector = Arc::new(Connector::new(
        connection.name.clone(),
        ConnectionStateStore::new(config.connection_dir()),
        local,
        Arc::new(ProtocolDriverFactory::new(
            config.secrets.directory.clone(),
            config.connection_dir(),
        )),
        bus.clone(),
        LocationHierarchy::new(
            &connection.site_name,
            &connection.area,
            &connection.process,
            &connection.machine_name,
        ),
        ConnectorSettings::from(&config.connector),
        Some(ConnectorMetrics::new(&registry)?),
    ));
    let publisher = Publisher::from_config(
        &config,
        &streams,
        bus.clone(),
        Some(PublisherMetrics::new(&registry)?),
        Some(persistence_metrics),
    )?;

    let subscription = bus.subscribe(&job_topic(&connection.name)).await?;
    if connector.resume().await? {
        info!(connection = %connection.name, "connection resumed from its state file");
    }

    let (shutdown_tx, _) = broadcast::channel(4);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<&'static str>(2);
    let mut tasks = TaskSet::default();

    let control_shutdown = shutdown_tx.subscribe();
    let control_fatal = fatal_tx.clone();
    let serving = Arc::clone(&connector);
    tasks.spawn("control", async move {
        let result = serving.serve(subscription, control_shutdown).await;
        if result.is_err() {
            let _ = control_fatal.send("control").await;
        }
        result
    });

    let publisher_shutdown = shutdown_tx.subscribe();
    tasks.spawn("publisher", async move {
        let result = publisher.run(publisher_shutdown).await;
        if result.is_err() {
            let _ = fatal_tx.send("publisher").await;
        }
        Ok(result?)
    });

    info!(connection = %connection.name, "daemon running; waiting for termination signal");
    tokio::select! {
        signalled = signal::ctrl_c() => {
            signalled?;
            info!("ctrl-c received; shutting down");
        }
        Some(task) = fatal_rx.recv() => {
            warn!(task, "task failed; shutting down");
        }
    }
    let _ = shutdown_tx.send(());
    let joined = tasks.join().await;

    if let Err(err) = streams.flush_all() {
        warn!(error = %err, "failed to flush streams");
    }
    mqtt.shutdown().await;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    joined
}

fn inspect_stream(config: &RuntimeConfig) -> Result<()> {
    let name = config.local_stream_name();
    let root = config.stream_root();
    if !root.join(&name).is_dir() {
        println!("Stream {name} does not exist under {}", root.display());
        return Ok(());
    }
    let streams = StreamStore::new(
        root,
        StreamOptions::new(config.streams.max_bytes, config.streams.segment_bytes),
        None,
    );
    let stream = streams.open_stream(&name)?;
    let checkpoints =
        CheckpointStore::open(config.publisher_dir().join(CHECKPOINT_FILE_NAME), None)?;
    let show = |value: Option<u64>| value.map_or_else(|| "none".to_owned(), |v| v.to_string());

    println!(
        "Stream: {name}\nOldest: {}\nNewest: {}\nNext: {}\nRetained bytes: {}\nPrimary: {}\nTrailing: {}",
        show(stream.oldest_sequence()),
        show(stream.newest_sequence()),
        stream.next_sequence(),
        stream.retained_bytes(),
        show(checkpoints.get(&name, CheckpointKind::Primary)),
        show(checkpoints.get(&name, CheckpointKind::Trailing)),
    );
    Ok(())
}
