//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "OPC DA access through an HTTP/JSON gateway."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
//! OPC DA is COM-based, so reads go through a gateway on the OPC host that
//! exposes `/servers`, `/list` and `/read` and answers reads with
//! `[tag, value, quality, timestamp]` tuples.

use std::time::Duration;

use async_trait::async_trait;
use m2c_model::{OpcDaConfig, Quality};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{DeviceSample, ProtocolError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations the connector needs from an OPC DA server.
#[async_trait]
pub trait OpcDaClient: Send + Sync {
    /// Servers registered on the host.
    async fn servers(&self) -> Result<Vec<String>>;
    /// Item ids matching a browse pattern such as `Random.*`.
    async fn list(&self, pattern: &str) -> Result<Vec<String>>;
    /// Read tuples for `tags`, one per tag.
    async fn read(&self, tags: &[String]) -> Result<Vec<Vec<Value>>>;
}

/// Turn one read tuple into a sample. Tuples shorter than four elements mark
/// a failed read; tuples without a tag are discarded.
pub fn decode_tuple(tuple: &[Value]) -> Option<DeviceSample> {
    let tag = tuple.first()?.as_str()?.to_owned();
    if tuple.len() < 4 {
        return Some(DeviceSample::unreadable(tag));
    }
    let quality = match &tuple[2] {
        Value::String(raw) => Quality::from_device(raw),
        _ => Quality::Bad,
    };
    let timestamp = match &tuple[3] {
        Value::String(raw) => raw.clone(),
        Value::Null => return Some(DeviceSample::unreadable(tag)),
        other => other.to_string(),
    };
    Some(DeviceSample::new(tag, tuple[1].clone(), quality, timestamp))
}

/// Expand `patterns` through the server browse and merge with `tags`,
/// keeping first-seen order and dropping duplicates.
pub async fn resolve_tags(
    client: &dyn OpcDaClient,
    tags: &[String],
    patterns: &[String],
) -> Result<Vec<String>> {
    let mut resolved: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        if !resolved.contains(tag) {
            resolved.push(tag.clone());
        }
    }
    for pattern in patterns {
        for tag in client.list(pattern).await? {
            if !resolved.contains(&tag) {
                resolved.push(tag);
            }
        }
    }
    Ok(resolved)
}

#[derive(Serialize)]
struct ReadBody<'a> {
    server: &'a str,
    tags: &'a [String],
}

/// Gateway client for one OPC server on one host.
#[derive(Debug, Clone)]
pub struct HttpOpcDaClient {
    http: reqwest::Client,
    base: Url,
    server: String,
}

impl HttpOpcDaClient {
    pub fn new(config: &OpcDaConfig) -> Result<Self> {
        let base = Url::parse(&format!("http://{}:{}/", config.machine_ip, config.gateway_port))?;
        Self::with_base(base, &config.server_name)
    }

    pub fn with_base(base: Url, server: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base,
            server: server.to_owned(),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.base.join(path)?;
        let response = self.http.get(url).query(query).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtocolError::Server(format!("gateway returned {status}: {body}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl OpcDaClient for HttpOpcDaClient {
    async fn servers(&self) -> Result<Vec<String>> {
        self.get_json("servers", &[]).await
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        self.get_json("list", &[("server", self.server.as_str()), ("pattern", pattern)])
            .await
    }

    async fn read(&self, tags: &[String]) -> Result<Vec<Vec<Value>>> {
        let url = self.base.join("read")?;
        debug!(server = %self.server, tags = tags.len(), "opc da read");
        let response = self
            .http
            .post(url)
            .json(&ReadBody {
                server: &self.server,
                tags,
            })
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_tuples_become_samples() {
        let sample = decode_tuple(&[
            json!("Random.Int4"),
            json!(27652.13),
            json!("Good"),
            json!("2021-06-03 15:14:21.247000+00:00"),
        ])
        .unwrap();
        assert_eq!(sample.tag, "Random.Int4");
        assert_eq!(sample.quality, Some(Quality::Good));
        assert_eq!(sample.timestamp.as_deref(), Some("2021-06-03 15:14:21.247000+00:00"));
    }

    #[test]
    fn short_tuples_are_unreadable() {
        let sample = decode_tuple(&[json!("Random.Int4")]).unwrap();
        assert!(sample.is_unreadable());
        assert!(decode_tuple(&[]).is_none());
        assert!(decode_tuple(&[json!(4)]).is_none());
    }
}
