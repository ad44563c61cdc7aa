//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "OSI PI Web API client: WebId resolution and batch recorded reads."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use m2c_common::time::format_millis;
use m2c_model::{AuthMode, OsiPiConfig, Quality};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::window::ReadWindow;
use crate::{DeviceSample, ProtocolError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Environment variable holding a pre-acquired SPNEGO token for KERBEROS mode.
pub const NEGOTIATE_TOKEN_ENV: &str = "PI_NEGOTIATE_TOKEN";

/// How requests authenticate against the Web API.
#[derive(Clone, PartialEq, Eq)]
pub enum PiAuth {
    Basic { username: String, password: String },
    Negotiate { token: Option<String> },
}

impl std::fmt::Debug for PiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PiAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            PiAuth::Negotiate { token } => f
                .debug_struct("Negotiate")
                .field("token", &token.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

#[derive(Deserialize)]
struct SecretDocument {
    username: String,
    password: String,
}

impl PiAuth {
    /// Resolve credentials for `config`. BASIC reads `{secrets_dir}/{secret}.json`
    /// where `secret` is the last path segment of the credential ARN.
    pub fn for_config(config: &OsiPiConfig, secrets_dir: &Path) -> Result<Self> {
        match config.auth_mode {
            AuthMode::Basic => {
                let arn = config.credential_secret_arn.as_deref().ok_or_else(|| {
                    ProtocolError::Credentials("credentialSecretArn is not set".into())
                })?;
                let name = arn
                    .rsplit([':', '/'])
                    .next()
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| ProtocolError::Credentials(format!("cannot derive a secret name from `{arn}`")))?;
                let path = secrets_dir.join(format!("{name}.json"));
                let raw = std::fs::read(&path).map_err(|err| {
                    ProtocolError::Credentials(format!("{}: {err}", path.display()))
                })?;
                let secret: SecretDocument = serde_json::from_slice(&raw)?;
                Ok(PiAuth::Basic {
                    username: secret.username,
                    password: secret.password,
                })
            }
            AuthMode::Kerberos => Ok(PiAuth::Negotiate {
                token: std::env::var(NEGOTIATE_TOKEN_ENV).ok().filter(|token| !token.is_empty()),
            }),
        }
    }
}

/// A configured tag and its resolved WebId.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPoint {
    pub tag: String,
    pub web_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PointResponse {
    web_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StreamSet {
    #[serde(default)]
    items: Vec<StreamItems>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StreamItems {
    #[serde(default)]
    web_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    items: Vec<RecordedValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordedValue {
    timestamp: String,
    #[serde(default)]
    value: Value,
    #[serde(default = "default_good")]
    good: bool,
    #[serde(default)]
    questionable: bool,
}

fn default_good() -> bool {
    true
}

impl RecordedValue {
    fn quality(&self) -> Quality {
        if self.questionable {
            Quality::Uncertain
        } else if self.good {
            Quality::Good
        } else {
            Quality::Bad
        }
    }

    /// Digital states arrive as `{"Name": .., "Value": ..}`; keep the state name.
    fn scalar(&self) -> Value {
        match &self.value {
            Value::Object(state) => state
                .get("Name")
                .or_else(|| state.get("Value"))
                .cloned()
                .unwrap_or_else(|| self.value.clone()),
            other => other.clone(),
        }
    }
}

/// PI Web API client for one data server.
#[derive(Debug, Clone)]
pub struct PiWebClient {
    http: reqwest::Client,
    base: Url,
    server: String,
    auth: PiAuth,
}

impl PiWebClient {
    pub fn new(config: &OsiPiConfig, auth: PiAuth) -> Result<Self> {
        let mut base = config.api_url.trim().to_owned();
        if !base.ends_with('/') {
            base.push('/');
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;
        Ok(Self {
            http,
            base: Url::parse(&base)?,
            server: config.server_name.clone(),
            auth,
        })
    }

    fn get(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        let request = self.http.get(self.base.join(path)?);
        Ok(match &self.auth {
            PiAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            PiAuth::Negotiate { token: Some(token) } => {
                request.header(reqwest::header::AUTHORIZATION, format!("Negotiate {token}"))
            }
            PiAuth::Negotiate { token: None } => request,
        })
    }

    async fn send<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtocolError::Server(format!("PI Web API returned {status}: {body}")));
        }
        Ok(response.json().await?)
    }

    /// Look up the WebId of `\\{server}\{tag}`.
    pub async fn resolve_web_id(&self, tag: &str) -> Result<String> {
        let path = format!("\\\\{}\\{}", self.server, tag);
        let request = self.get("points")?.query(&[("path", path.as_str())]);
        let point: PointResponse = Self::send(request).await?;
        debug!(tag, web_id = %point.web_id, "resolved PI point");
        Ok(point.web_id)
    }

    pub async fn resolve_all(&self, tags: &[String]) -> Result<Vec<ResolvedPoint>> {
        let mut points = Vec::with_capacity(tags.len());
        for tag in tags {
            points.push(ResolvedPoint {
                tag: tag.clone(),
                web_id: self.resolve_web_id(tag).await?,
            });
        }
        Ok(points)
    }

    /// Recorded values of every point inside `window`, in one request.
    pub async fn recorded(&self, points: &[ResolvedPoint], window: &ReadWindow) -> Result<Vec<DeviceSample>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let start = format_millis(window.start);
        let end = format_millis(window.end);
        let mut query: Vec<(&str, &str)> = points
            .iter()
            .map(|point| ("webId", point.web_id.as_str()))
            .collect();
        query.push(("startTime", start.as_str()));
        query.push(("endTime", end.as_str()));
        let set: StreamSet = Self::send(self.get("streamsets/recorded")?.query(&query)).await?;

        let by_web_id: HashMap<&str, &str> = points
            .iter()
            .map(|point| (point.web_id.as_str(), point.tag.as_str()))
            .collect();
        let mut samples = Vec::new();
        for stream in set.items {
            let tag = stream
                .web_id
                .as_deref()
                .and_then(|id| by_web_id.get(id).copied())
                .map(str::to_owned)
                .or(stream.name);
            let Some(tag) = tag else {
                warn!("PI stream without WebId or name skipped");
                continue;
            };
            for value in &stream.items {
                samples.push(DeviceSample::new(
                    tag.clone(),
                    value.scalar(),
                    value.quality(),
                    value.timestamp.clone(),
                ));
            }
        }
        Ok(samples)
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}
