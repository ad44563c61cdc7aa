//! ---
//! m2c_section: "15-testing-qa-runbook"
//! m2c_subsection: "tests"
//! m2c_type: "test"
//! m2c_scope: "code"
//! m2c_description: "OPC DA gateway to IoT topic through the connector, local stream and publisher."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{get, post};
use axum::{Json, Router};
use m2c_common::config::RuntimeConfig;
use m2c_connector::{ConnectionState, Connector, ConnectorSettings, ProtocolDriverFactory};
use m2c_model::{CanonicalRecord, ControlVerb, LocationHierarchy, UNREADABLE_VALUE};
use m2c_msg::InMemoryBus;
use m2c_persistence::{
    CheckpointKind, ConnectionStateStore, LocalRecordStream, StreamOptions, StreamStore,
};
use m2c_publisher::Publisher;
use serde_json::{json, Value};
use tokio::net::TcpListener;

const INT4_ALIAS: &str = "site/area/process/machine/Random.Int4";
const REAL8_ALIAS: &str = "site/area/process/machine/Random.Real8";

/// OPC gateway answering `Random.Int4` with a full tuple and every other tag
/// with the 1-tuple of a failed read.
async fn spawn_gateway() -> Result<(u16, Arc<AtomicUsize>)> {
    let reads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reads);
    let router = Router::new()
        .route("/servers", get(|| async { Json(json!(["Matrikon.OPC.Simulation.1"])) }))
        .route("/list", get(|| async { Json(json!([])) }))
        .route(
            "/read",
            post(move |Json(body): Json<Value>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let rows: Vec<Value> = body["tags"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .map(|tag| {
                            if tag == "Random.Int4" {
                                json!([tag, 27652.13, "Good", "2021-06-03 15:14:21.247000+00:00"])
                            } else {
                                json!([tag])
                            }
                        })
                        .collect();
                    Json(Value::Array(rows))
                }
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((port, reads))
}

fn job(verb: &str, port: u16, tags: &[&str]) -> Vec<u8> {
    json!({
        "control": verb,
        "connectionName": "conn",
        "protocol": "opcda",
        "sendDataToIoTTopic": true,
        "siteName": "site",
        "area": "area",
        "process": "process",
        "machineName": "machine",
        "opcDa": {
            "serverName": "Matrikon.OPC.Simulation.1",
            "machineIp": "127.0.0.1",
            "gatewayPort": port,
            "tags": tags,
            "iterations": 1,
            "interval": 0.1
        }
    })
    .to_string()
    .into_bytes()
}

fn runtime_config(work_root: &Path) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.work_root = work_root.to_path_buf();
    config.connection.name = "conn".to_owned();
    config.connection.site_name = "site".to_owned();
    config.connection.area = "area".to_owned();
    config.connection.process = "process".to_owned();
    config.connection.machine_name = "machine".to_owned();
    config.sinks.send_to_iot_topic = true;
    config
}

/// One daemon's worth of wiring over a shared work root.
struct Edge {
    config: RuntimeConfig,
    bus: Arc<InMemoryBus>,
    streams: StreamStore,
    local: Arc<LocalRecordStream>,
    connector: Arc<Connector>,
}

impl Edge {
    fn boot(work_root: &Path) -> Result<Self> {
        let config = runtime_config(work_root);
        let bus = Arc::new(InMemoryBus::new());
        let streams = StreamStore::new(
            config.stream_root(),
            StreamOptions::new(1 << 20, 1 << 16),
            None,
        );
        let local = streams.open_stream(&config.local_stream_name())?;
        let connector = Arc::new(Connector::new(
            "conn",
            ConnectionStateStore::new(config.connection_dir()),
            Arc::clone(&local),
            Arc::new(ProtocolDriverFactory::new(
                work_root.join("secrets"),
                config.connection_dir(),
            )),
            bus.clone(),
            LocationHierarchy::new("site", "area", "process", "machine"),
            ConnectorSettings {
                connection_retry: 2,
                error_retry: 3,
                retry_unit: Duration::from_millis(10),
                stop_wait_cap: Duration::from_secs(3),
            },
            None,
        ));
        Ok(Self {
            config,
            bus,
            streams,
            local,
            connector,
        })
    }

    fn publisher(&self) -> Result<Publisher> {
        Ok(Publisher::from_config(
            &self.config,
            &self.streams,
            self.bus.clone(),
            None,
            None,
        )?)
    }

    fn info_messages(&self) -> Vec<Value> {
        self.bus
            .published_on("m2c2/info/conn")
            .iter()
            .map(|message| message.json().unwrap()["message"].clone())
            .collect()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn stored(stream: &LocalRecordStream, sequence: u64) -> Value {
    let record = CanonicalRecord::from_bytes(&stream.read(sequence).unwrap()).unwrap();
    serde_json::to_value(record).unwrap()
}

#[tokio::test]
async fn opc_da_values_reach_the_iot_topic() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (port, _) = spawn_gateway().await?;
    let edge = Edge::boot(dir.path())?;

    edge.connector
        .handle(&job("start", port, &["Random.Int4", "Random.Real8"]))
        .await;
    assert_eq!(edge.connector.state(), ConnectionState::Running);
    wait_until(|| edge.local.next_sequence() >= 2).await;
    edge.connector
        .handle(&job("stop", port, &["Random.Int4", "Random.Real8"]))
        .await;

    assert_eq!(
        stored(&edge.local, 0),
        json!({
            "alias": INT4_ALIAS,
            "messages": [{
                "name": INT4_ALIAS,
                "value": 27652.13,
                "quality": "Good",
                "timestamp": "2021-06-03 15:14:21.247000+00:00"
            }]
        })
    );
    assert_eq!(
        stored(&edge.local, 1),
        json!({
            "alias": REAL8_ALIAS,
            "messages": [{"name": REAL8_ALIAS, "value": UNREADABLE_VALUE}]
        })
    );

    let mut publisher = edge.publisher()?;
    assert!(publisher.step().await?);
    assert!(publisher.step().await?);

    let data = edge.bus.published_on("m2c2/data/conn/machine/Random.Int4");
    assert!(!data.is_empty());
    let payload = data[0].json()?;
    assert_eq!(payload["siteName"], "site");
    assert_eq!(payload["tag"], "Random.Int4");
    assert_eq!(payload["messages"][0]["value"], 27652.13);
    let degraded = edge.bus.published_on("m2c2/data/conn/machine/Random.Real8");
    assert_eq!(degraded[0].json()?["messages"][0]["value"], UNREADABLE_VALUE);
    Ok(())
}

#[tokio::test]
async fn stop_while_running_closes_the_session_and_rewrites_state() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (port, reads) = spawn_gateway().await?;
    let edge = Edge::boot(dir.path())?;

    edge.connector.handle(&job("start", port, &["Random.Int4"])).await;
    wait_until(|| edge.local.next_sequence() >= 3).await;

    let before = edge.local.next_sequence();
    edge.connector.handle(&job("stop", port, &["Random.Int4"])).await;
    assert!(edge.local.next_sequence() <= before + 1);
    assert_eq!(edge.connector.state(), ConnectionState::Idle);
    assert!(edge
        .info_messages()
        .contains(&json!("Connection stopped.")));

    let state = ConnectionStateStore::new(edge.config.connection_dir())
        .read()?
        .expect("state file kept after stop");
    assert_eq!(state.definition.control, ControlVerb::Stop);

    let settled = reads.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(reads.load(Ordering::SeqCst), settled);
    Ok(())
}

#[tokio::test]
async fn restart_resumes_both_halves_without_redelivery() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (port, _) = spawn_gateway().await?;

    let routed_before = {
        let edge = Edge::boot(dir.path())?;
        edge.connector.handle(&job("start", port, &["Random.Int4"])).await;
        wait_until(|| edge.local.next_sequence() >= 3).await;

        let mut publisher = edge.publisher()?;
        while publisher.step().await? {}
        edge.connector.shutdown().await;
        publisher
            .checkpoints()
            .get(edge.local.name(), CheckpointKind::Trailing)
            .expect("trailing written")
    };

    let edge = Edge::boot(dir.path())?;
    let resumed_from = edge.local.next_sequence();
    assert!(edge.connector.resume().await?);
    wait_until(|| edge.local.next_sequence() >= resumed_from + 2).await;
    edge.connector.shutdown().await;

    let mut publisher = edge.publisher()?;
    assert_eq!(publisher.cursor(), routed_before + 1);
    while publisher.step().await? {}

    let delivered = edge.bus.published_on("m2c2/data/conn/machine/#").len() as u64;
    assert_eq!(delivered, edge.local.next_sequence() - (routed_before + 1));
    Ok(())
}
