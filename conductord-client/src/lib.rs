//! Async client for the conductor control-plane HTTP API.

use std::time::Duration;

use conductor_common::config::ClientConfig;
use conductor_common::{
    ActivateResponse, AddRemoteWorkspaceRequest, AddWorkspaceRequest, AddWorkspaceResponse,
    DisposeResponse, ErrorBody, ErrorKind, ForgetResponse, HealthResponse, PathResponse,
    RenameWorkspaceRequest, ShutdownResponse, WorkspaceListResponse, WorkspaceResponse,
};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon not available at {0}")]
    DaemonUnavailable(String),
    /// The daemon answered with a non-2xx status. `kind` is `None` when the
    /// body carried no recognised error code.
    #[error("{message}")]
    Api {
        status: u16,
        kind: Option<ErrorKind>,
        message: String,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Clone)]
pub struct ControlClient {
    base: Url,
    token: Option<String>,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|err| {
            ClientError::InvalidResponse(format!("bad daemon URL {base_url}: {err}"))
        })?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
        Ok(Self { base, token, http })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(&config.base_url(), config.token.clone())
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.request::<(), _>(Method::GET, &["health"], None).await
    }

    pub async fn list(&self) -> Result<WorkspaceListResponse> {
        self.request::<(), _>(Method::GET, &["workspaces"], None).await
    }

    pub async fn add(&self, path: &str, name: Option<&str>) -> Result<AddWorkspaceResponse> {
        let body = AddWorkspaceRequest {
            path: path.to_string(),
            name: name.map(str::to_string),
        };
        self.request(Method::POST, &["workspaces"], Some(&body)).await
    }

    pub async fn add_remote(
        &self,
        base_url: &str,
        directory: Option<&str>,
        name: Option<&str>,
    ) -> Result<AddWorkspaceResponse> {
        let body = AddRemoteWorkspaceRequest {
            base_url: base_url.to_string(),
            directory: directory.map(str::to_string),
            name: name.map(str::to_string),
        };
        self.request(Method::POST, &["workspaces", "remote"], Some(&body))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<WorkspaceResponse> {
        self.request::<(), _>(Method::GET, &["workspaces", id], None)
            .await
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<WorkspaceResponse> {
        let body = RenameWorkspaceRequest {
            name: name.to_string(),
        };
        self.request(Method::PATCH, &["workspaces", id], Some(&body))
            .await
    }

    pub async fn forget(&self, id: &str) -> Result<ForgetResponse> {
        self.request::<(), _>(Method::DELETE, &["workspaces", id], None)
            .await
    }

    pub async fn activate(&self, id: &str) -> Result<ActivateResponse> {
        self.request::<(), _>(Method::POST, &["workspaces", id, "activate"], None)
            .await
    }

    pub async fn workspace_path(&self, id: &str) -> Result<PathResponse> {
        self.request::<(), _>(Method::GET, &["workspaces", id, "path"], None)
            .await
    }

    pub async fn dispose(&self, id: &str) -> Result<DisposeResponse> {
        self.request::<(), _>(Method::POST, &["instances", id, "dispose"], None)
            .await
    }

    pub async fn shutdown(&self) -> Result<ShutdownResponse> {
        self.request::<(), _>(Method::POST, &["shutdown"], None)
            .await
    }

    /// Poll `/health` until it answers or `timeout` elapses.
    pub async fn wait_until_healthy(&self, timeout: Duration) -> Result<HealthResponse> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.health().await {
                Ok(health) => return Ok(health),
                Err(err) => debug!(error = %err, "Daemon not answering yet"),
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll `/health` until the daemon stops answering or `timeout` elapses.
    pub async fn wait_until_gone(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.health().await {
                Err(ClientError::DaemonUnavailable(_)) => return Ok(()),
                Ok(_) | Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn request<B, T>(&self, method: Method, segments: &[&str], body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(segments)?;
        let mut request = self.http.request(method, url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|err| self.transport_error(err))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| self.transport_error(err))?;

        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        serde_json::from_slice(&bytes).map_err(|err| ClientError::InvalidResponse(err.to_string()))
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ClientError::InvalidResponse(format!("cannot route through {}", self.base))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn transport_error(&self, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_connect() || err.is_request() {
            ClientError::DaemonUnavailable(self.base_url().to_string())
        } else {
            ClientError::InvalidResponse(err.to_string())
        }
    }
}

fn api_error(status: StatusCode, bytes: &[u8]) -> ClientError {
    match serde_json::from_slice::<ErrorBody>(bytes) {
        Ok(body) => ClientError::Api {
            status: status.as_u16(),
            kind: body.code.as_deref().and_then(ErrorKind::from_code),
            message: body.error,
        },
        Err(_) => ClientError::Api {
            status: status.as_u16(),
            kind: None,
            message: format!(
                "daemon returned HTTP {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(bytes).trim()
            ),
        },
    }
}
