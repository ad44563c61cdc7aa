//! ---
//! m2c_section: "15-testing-qa-runbook"
//! m2c_subsection: "tests"
//! m2c_type: "test"
//! m2c_scope: "code"
//! m2c_description: "OSI PI driver catching up on a backlog against a local PI Web API."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DurationRound, TimeDelta, Utc};
use m2c_common::time::format_millis;
use m2c_connector::{DriverFactory, ProtocolDriverFactory, OSI_PI_CURSOR_FILE};
use m2c_model::ConnectionDefinition;
use m2c_persistence::TimeCursorFile;
use serde_json::{json, Value};
use tokio::net::TcpListener;

type Windows = Arc<Mutex<Vec<(String, String)>>>;

async fn spawn_pi() -> Result<(String, Windows)> {
    let windows: Windows = Arc::default();
    let seen = Arc::clone(&windows);
    let router = Router::new()
        .route(
            "/piwebapi/points",
            get(|Query(query): Query<HashMap<String, String>>| async move {
                let tag = query["path"].rsplit('\\').next().unwrap_or_default().to_owned();
                Json(json!({ "WebId": format!("W-{tag}") }))
            }),
        )
        .route(
            "/piwebapi/streamsets/recorded",
            get(move |Query(query): Query<Vec<(String, String)>>| {
                let seen = Arc::clone(&seen);
                async move {
                    let find = |key: &str| {
                        query
                            .iter()
                            .find(|(name, _)| name == key)
                            .map(|(_, value)| value.clone())
                            .unwrap_or_default()
                    };
                    let start = find("startTime");
                    seen.lock().unwrap().push((start.clone(), find("endTime")));
                    Json(json!({
                        "Items": [{
                            "WebId": "W-Sinusoid",
                            "Name": "Sinusoid",
                            "Items": [{"Timestamp": start, "Value": 1.5, "Good": true, "Questionable": false}]
                        }]
                    }))
                }
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((format!("http://{addr}/piwebapi"), windows))
}

fn definition(api_url: &str) -> ConnectionDefinition {
    ConnectionDefinition::from_value(json!({
        "control": "start",
        "connectionName": "conn",
        "protocol": "osipi",
        "siteName": "site",
        "area": "area",
        "process": "process",
        "machineName": "machine",
        "osiPi": {
            "apiUrl": api_url,
            "serverName": "PISRV",
            "authMode": "KERBEROS",
            "tags": ["Sinusoid"],
            "requestFrequency": 5,
            "catchupFrequency": 0.1,
            "maxRequestDuration": 60,
            "queryOffset": 0
        }
    }))
    .expect("valid osi pi definition")
}

#[tokio::test]
async fn outage_backlog_is_read_in_capped_windows() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (api_url, windows) = spawn_pi().await?;

    // last read ten minutes ago, before the outage
    let last = Utc::now().duration_trunc(TimeDelta::seconds(1))? - TimeDelta::minutes(10);
    let cursor = TimeCursorFile::new(dir.path().join(OSI_PI_CURSOR_FILE));
    cursor.store(last)?;

    let factory = ProtocolDriverFactory::new(dir.path().join("secrets"), dir.path());
    let mut driver = factory.create(&definition(&api_url))?;
    driver.open().await?;
    let outcome = driver.poll().await?;

    let end = last + TimeDelta::seconds(60);
    assert_eq!(
        windows.lock().unwrap().as_slice(),
        &[(format_millis(last), format_millis(end))]
    );
    assert_eq!(outcome.next_delay, Some(Duration::from_millis(100)));
    assert_eq!(outcome.samples.len(), 1);
    assert_eq!(outcome.samples[0].tag, "Sinusoid");
    assert_eq!(cursor.load()?, Some(end + TimeDelta::milliseconds(1)));

    // the next window starts right after the previous one
    driver.poll().await?;
    let second = windows.lock().unwrap()[1].clone();
    assert_eq!(second.0, format_millis(end + TimeDelta::milliseconds(1)));

    let diagnostics: Value = driver.diagnose().await?;
    assert_eq!(diagnostics["points"][0]["webId"], "W-Sinusoid");
    driver.close().await;
    Ok(())
}
