//! Loopback control-plane HTTP API.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use conductor_common::{
    ActivateResponse, AddRemoteWorkspaceRequest, AddWorkspaceRequest, AddWorkspaceResponse,
    ConductorError, DisposeResponse, ErrorBody, ErrorKind, ForgetResponse, HealthResponse,
    PathResponse, RenameWorkspaceRequest, ShutdownResponse, WorkspaceListResponse,
    WorkspaceResponse,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::AuthManager;
use crate::registry::Registry;
use crate::router::InstanceRouter;
use crate::store::StateStore;
use crate::supervisor::EngineProvider;

/// Everything the handlers need, shared behind one `Arc`.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<ControlPlaneInner>,
}

struct ControlPlaneInner {
    store: Arc<StateStore>,
    registry: Arc<Registry>,
    router: Arc<InstanceRouter>,
    engine: Arc<dyn EngineProvider>,
    auth: AuthManager,
    data_dir: PathBuf,
    shutdown: watch::Sender<bool>,
    warming: AtomicBool,
}

impl ControlPlane {
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<Registry>,
        router: Arc<InstanceRouter>,
        engine: Arc<dyn EngineProvider>,
        token: Option<String>,
        data_dir: PathBuf,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(ControlPlaneInner {
                store,
                registry,
                router,
                engine,
                auth: AuthManager::new(token),
                data_dir,
                shutdown,
                warming: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_authorized(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if self.inner.auth.validate(headers.get(AUTHORIZATION)) {
            Ok(())
        } else {
            Err(ConductorError::Unauthorized.into())
        }
    }

    /// Start the engine in the background unless a start is already underway.
    fn warm_engine(&self) {
        if self.inner.warming.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.clone();
        tokio::spawn(async move {
            if let Err(err) = state.inner.engine.ensure_running().await {
                warn!(error = %err, "Background engine start failed");
            }
            state.inner.warming.store(false, Ordering::SeqCst);
        });
    }
}

#[derive(Debug)]
pub struct ApiError(ConductorError);

impl From<ConductorError> for ApiError {
    fn from(err: ConductorError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ConductorError::invalid(rejection.body_text()))
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        match kind {
            ErrorKind::Fatal => error!(error = %self.0, "Control-plane request failed"),
            ErrorKind::BackendUnavailable => warn!(error = %self.0, "Engine unavailable"),
            _ => debug!(error = %self.0, "Request rejected"),
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: Some(kind.code().to_string()),
        };
        (status_for(kind), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: ControlPlane) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workspaces", get(list_workspaces).post(add_workspace))
        .route("/workspaces/remote", post(add_remote_workspace))
        .route(
            "/workspaces/:id",
            get(get_workspace)
                .patch(rename_workspace)
                .delete(forget_workspace),
        )
        .route("/workspaces/:id/activate", post(activate_workspace))
        .route("/workspaces/:id/path", get(workspace_path))
        .route("/instances/:id/dispose", post(dispose_instance))
        .route("/shutdown", post(shutdown))
        .fallback(unmatched)
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

/// Unknown routes still answer with an error body. An empty id segment
/// (`/workspaces//path`) never matches `:id` and is reported as bad input.
async fn unmatched(method: Method, uri: Uri) -> Response {
    let path = uri.path();
    let empty_id = ["/workspaces/", "/instances/"].iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    });
    if empty_id {
        return ApiError(ConductorError::invalid("workspace id must not be empty")).into_response();
    }

    debug!(%method, %path, "No route");
    let body = ErrorBody {
        error: format!("no route for {} {}", method, path),
        code: Some(ErrorKind::NotFound.code().to_string()),
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

async fn health(Extension(state): Extension<ControlPlane>) -> Json<HealthResponse> {
    let engine = state.inner.engine.status().await;
    if !engine.running && !engine.starting {
        state.warm_engine();
    }
    let doc = state.inner.store.snapshot().await;

    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        cli_version: doc.cli_version,
        build_id: Some(conductor_build_info::build_id().to_string()),
        data_dir: state.inner.data_dir.display().to_string(),
        daemon: doc.daemon,
        engine: engine.record,
        engine_running: engine.running,
        engine_starting: engine.starting,
        binaries: doc.binaries,
        active_id: doc.active_id,
        workspace_count: doc.workspaces.len(),
    })
}

async fn list_workspaces(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
) -> ApiResult<Json<WorkspaceListResponse>> {
    state.ensure_authorized(&headers)?;
    let (active_id, workspaces) = state.inner.registry.list().await;
    Ok(Json(WorkspaceListResponse {
        active_id,
        workspaces,
    }))
}

async fn add_workspace(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
    payload: Result<Json<AddWorkspaceRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AddWorkspaceResponse>)> {
    state.ensure_authorized(&headers)?;
    let Json(request) = payload?;
    let outcome = state
        .inner
        .registry
        .add(&request.path, request.name.as_deref())
        .await?;
    Ok(added(outcome.workspace, outcome.created))
}

async fn add_remote_workspace(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
    payload: Result<Json<AddRemoteWorkspaceRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AddWorkspaceResponse>)> {
    state.ensure_authorized(&headers)?;
    let Json(request) = payload?;
    let outcome = state
        .inner
        .registry
        .add_remote(
            &request.base_url,
            request.directory.as_deref(),
            request.name.as_deref(),
        )
        .await?;
    Ok(added(outcome.workspace, outcome.created))
}

fn added(
    workspace: conductor_common::Workspace,
    created: bool,
) -> (StatusCode, Json<AddWorkspaceResponse>) {
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(AddWorkspaceResponse { workspace, created }))
}

async fn get_workspace(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkspaceResponse>> {
    state.ensure_authorized(&headers)?;
    let workspace = state.inner.registry.get(&id).await?;
    Ok(Json(WorkspaceResponse { workspace }))
}

async fn rename_workspace(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<RenameWorkspaceRequest>, JsonRejection>,
) -> ApiResult<Json<WorkspaceResponse>> {
    state.ensure_authorized(&headers)?;
    let Json(request) = payload?;
    let workspace = state
        .inner
        .registry
        .update_display_name(&id, &request.name)
        .await?;
    Ok(Json(WorkspaceResponse { workspace }))
}

async fn forget_workspace(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ForgetResponse>> {
    state.ensure_authorized(&headers)?;
    let removed = state.inner.registry.forget(&id).await?;
    Ok(Json(ForgetResponse {
        id: removed.id,
        removed: true,
    }))
}

async fn activate_workspace(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ActivateResponse>> {
    state.ensure_authorized(&headers)?;
    let workspace = state.inner.registry.activate(&id).await?;
    Ok(Json(ActivateResponse {
        active_id: workspace.id.clone(),
        workspace,
    }))
}

async fn workspace_path(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<PathResponse>> {
    state.ensure_authorized(&headers)?;
    Ok(Json(state.inner.router.resolve_path(&id).await?))
}

async fn dispose_instance(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DisposeResponse>> {
    state.ensure_authorized(&headers)?;
    let disposed = state.inner.router.dispose(&id).await?;
    Ok(Json(DisposeResponse { id, disposed }))
}

async fn shutdown(
    Extension(state): Extension<ControlPlane>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<ShutdownResponse>)> {
    state.ensure_authorized(&headers)?;
    info!("Shutdown requested over the control plane");
    state.inner.shutdown.send_replace(true);
    Ok((StatusCode::ACCEPTED, Json(ShutdownResponse { ok: true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineClient;
    use crate::testing::{start_stub, FixedEngine};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        dir: TempDir,
        shutdown: watch::Receiver<bool>,
    }

    async fn harness(token: Option<&str>) -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("conductor-state.json")));
        let registry = Arc::new(Registry::new(store.clone()));
        let engine = FixedEngine::new(vec![start_stub().await]);
        let router = Arc::new(InstanceRouter::new(
            registry.clone(),
            engine.clone(),
            EngineClient::new(Duration::from_secs(2)).unwrap(),
        ));
        let (tx, rx) = watch::channel(false);
        let state = ControlPlane::new(
            store,
            registry,
            router,
            engine,
            token.map(str::to_string),
            dir.path().to_path_buf(),
            tx,
        );
        Harness {
            app: super::router(state),
            dir,
            shutdown: rx,
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn workspace_lifecycle_over_http() {
        let h = harness(None).await;
        let project = h.dir.path().join("project");
        std::fs::create_dir(&project).unwrap();

        let (status, body) = call(
            &h.app,
            "POST",
            "/workspaces",
            Some(json!({ "path": project.to_str().unwrap() })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["created"], true);
        let id = body["workspace"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &h.app,
            "POST",
            "/workspaces",
            Some(json!({ "path": project.to_str().unwrap() })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["created"], false);

        let (status, body) =
            call(&h.app, "POST", &format!("/workspaces/{id}/activate"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activeId"], id.as_str());

        let (status, body) =
            call(&h.app, "GET", &format!("/workspaces/{id}/path"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["workspace"]["id"], id.as_str());
        assert!(body["path"].is_object());

        let (status, body) = call(
            &h.app,
            "PATCH",
            &format!("/workspaces/{id}"),
            Some(json!({ "name": "Renamed" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["workspace"]["name"], "Renamed");

        let (status, body) =
            call(&h.app, "POST", &format!("/instances/{id}/dispose"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disposed"], true);

        let (status, body) = call(&h.app, "DELETE", &format!("/workspaces/{id}"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], true);

        let (status, body) = call(&h.app, "GET", "/workspaces", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["activeId"].is_null());
        assert_eq!(body["workspaces"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let h = harness(None).await;

        let (status, body) = call(&h.app, "GET", "/workspaces/ws-missing", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
        assert!(body["error"].as_str().unwrap().contains("ws-missing"));

        let (status, body) = call(
            &h.app,
            "POST",
            "/workspaces",
            Some(json!({ "path": "/definitely/not/here" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");

        let (status, body) =
            call(&h.app, "POST", "/workspaces", Some(json!({ "nope": 1 })), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");

        let (status, _) = call(
            &h.app,
            "POST",
            "/workspaces/remote",
            Some(json!({ "baseUrl": "ftp://example.com" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unmatched_routes_get_json_errors() {
        let h = harness(None).await;

        let (status, body) = call(&h.app, "GET", "/workspaces//path", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");

        let (status, body) = call(&h.app, "POST", "/instances//dispose", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");

        let (status, body) = call(&h.app, "GET", "/nowhere", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
        assert!(body["error"].as_str().unwrap().contains("/nowhere"));
    }

    #[tokio::test]
    async fn token_guards_everything_but_health() {
        let h = harness(Some("s3cret")).await;

        let (status, body) = call(&h.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["engineRunning"], true);

        let (status, body) = call(&h.app, "GET", "/workspaces", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let (status, _) = call(&h.app, "GET", "/workspaces", None, Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn shutdown_flips_the_signal() {
        let mut h = harness(None).await;
        let (status, body) = call(&h.app, "POST", "/shutdown", None, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["ok"], true);
        h.shutdown.changed().await.unwrap();
        assert!(*h.shutdown.borrow());
    }
}
