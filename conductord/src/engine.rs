//! HTTP client for the engine's directory-keyed endpoints.

use std::time::Duration;

use conductor_common::ConductorError;
use serde_json::Value;
use thiserror::Error;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);
const BODY_SNIPPET_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Connection refused, reset or timed out.
    #[error("engine at {base_url} unreachable: {message}")]
    Unreachable { base_url: String, message: String },

    #[error("engine returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid engine response: {0}")]
    Invalid(String),
}

impl EngineError {
    /// Transport failures are the only ones worth an ensure-running retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Unreachable { .. })
    }
}

impl From<EngineError> for ConductorError {
    fn from(err: EngineError) -> Self {
        ConductorError::unavailable(err.to_string())
    }
}

#[derive(Clone)]
pub struct EngineClient {
    http: reqwest::Client,
}

impl EngineClient {
    pub fn new(request_timeout: Duration) -> Result<Self, ConductorError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout.min(Duration::from_secs(2)))
            .build()
            .map_err(|err| ConductorError::fatal("failed to build engine HTTP client", err))?;
        Ok(Self { http })
    }

    /// `GET /global/health`. Ready means 2xx and no explicit `healthy: false`.
    pub async fn health(&self, base_url: &str) -> Result<bool, EngineError> {
        let response = self
            .http
            .get(endpoint(base_url, "/global/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|err| unreachable(base_url, err))?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let body = response.text().await.unwrap_or_default();
        let healthy = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| value.get("healthy").and_then(Value::as_bool))
            .unwrap_or(true);
        Ok(healthy)
    }

    /// `GET /path?directory=..`; the body is returned as-is.
    pub async fn path(
        &self,
        base_url: &str,
        directory: Option<&str>,
    ) -> Result<Value, EngineError> {
        let mut request = self.http.get(endpoint(base_url, "/path"));
        if let Some(directory) = directory {
            request = request.query(&[("directory", directory)]);
        }
        let body = send(request, base_url).await?;
        serde_json::from_str(&body).map_err(|err| EngineError::Invalid(err.to_string()))
    }

    /// `POST /instance/dispose?directory=..`.
    pub async fn dispose(
        &self,
        base_url: &str,
        directory: Option<&str>,
    ) -> Result<bool, EngineError> {
        let mut request = self.http.post(endpoint(base_url, "/instance/dispose"));
        if let Some(directory) = directory {
            request = request.query(&[("directory", directory)]);
        }
        let body = send(request, base_url).await?;
        Ok(parse_disposed(&body))
    }
}

async fn send(request: reqwest::RequestBuilder, base_url: &str) -> Result<String, EngineError> {
    let response = request
        .send()
        .await
        .map_err(|err| unreachable(base_url, err))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| unreachable(base_url, err))?;

    if !status.is_success() {
        return Err(EngineError::Status {
            status: status.as_u16(),
            body: snippet(&body),
        });
    }
    Ok(body)
}

/// The engine answers dispose with a bare boolean or an object carrying
/// `disposed` (older builds: `ok`). Anything else on 2xx counts as done.
fn parse_disposed(body: &str) -> bool {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Bool(flag)) => flag,
        Ok(Value::Object(map)) => map
            .get("disposed")
            .or_else(|| map.get("ok"))
            .and_then(Value::as_bool)
            .unwrap_or(true),
        _ => true,
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

fn unreachable(base_url: &str, err: reqwest::Error) -> EngineError {
    EngineError::Unreachable {
        base_url: base_url.to_string(),
        message: err.to_string(),
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= BODY_SNIPPET_LEN {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(BODY_SNIPPET_LEN).collect();
    format!("{cut}...")
}
