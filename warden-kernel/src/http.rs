//! REST API of the controller.
//!
//! Read queries for dashboards and operation triggers for operators. Every
//! route except `/health` requires the `x-api-key` header; with no key
//! configured the API refuses everything but `/health`.

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::catalog::StatusSummary;
use crate::diagnose::Diagnosis;
use crate::engine::Warden;
use crate::error::WardenError;
use crate::health::{FleetReport, HealthResult, Readiness};
use crate::models::{BackupKind, BackupRecord, HostRef, Node, NodeStatus, ResourceMetrics, RestoreAttempt};
use crate::recovery::RecoveryReport;

#[derive(Clone)]
pub struct AppState {
    pub warden: Warden,
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(warden: Warden, api_key: Option<String>) -> Self {
        Self {
            warden,
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
        }
    }
}

#[derive(Serialize)]
struct NodeView {
    id: String,
    host: String,
    status: NodeStatus,
    score: u8,
    last_seen: Option<String>,
    last_checked: Option<String>,
    stale: bool,
    stale_for_seconds: Option<i64>,
    metrics: Option<ResourceMetrics>,
    program_version: Option<String>,
    recovery_attempts: u32,
}

fn rfc3339(at: Option<OffsetDateTime>) -> Option<String> {
    at.and_then(|t| t.format(&Rfc3339).ok())
}

fn to_view(node: &Node, stale_after_secs: u64) -> NodeView {
    let age = node
        .last_checked
        .map(|checked| (OffsetDateTime::now_utc() - checked).whole_seconds().max(0));
    NodeView {
        id: node.id.clone(),
        host: format!("{}:{}", node.host.destination(), node.host.port),
        status: node.status,
        score: node.last_score,
        last_seen: rfc3339(node.last_seen),
        last_checked: rfc3339(node.last_checked),
        stale: age.map(|a| a as u64 >= stale_after_secs).unwrap_or(true),
        stale_for_seconds: age,
        metrics: node.metrics,
        program_version: node.program_version.clone(),
        recovery_attempts: node.recovery_attempts,
    }
}

/// Maps engine errors to HTTP responses with a JSON body.
pub struct ApiError(WardenError);

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WardenError::NotFound(_) => StatusCode::NOT_FOUND,
            WardenError::Corruption { .. } => StatusCode::CONFLICT,
            WardenError::Connectivity { .. } | WardenError::RemoteCommand { .. } => StatusCode::BAD_GATEWAY,
            WardenError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        warn!("WARDEN_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("rejected request to {} without a valid API key", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/fleet/report", get(fleet_report))
        .route("/nodes", get(list_nodes).post(register_node))
        .route("/nodes/{id}", get(get_node).delete(retire_node))
        .route("/nodes/{id}/status", get(latest_status))
        .route("/nodes/{id}/readiness", get(readiness))
        .route("/nodes/{id}/diagnosis", get(diagnosis))
        .route("/nodes/{id}/check", post(check_node))
        .route("/nodes/{id}/backups", get(list_backups).post(create_backup))
        .route("/nodes/{id}/restores", get(list_restores))
        .route("/nodes/{id}/restore", post(restore))
        .route("/nodes/{id}/recover", post(recover))
        .route("/nodes/{id}/acknowledge", post(acknowledge))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    id: String,
    #[serde(flatten)]
    host: HostRef,
}

#[derive(Debug, Deserialize)]
struct RestoreBody {
    backup_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct RecoverBody {
    backup_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BackupBody {
    kind: Option<BackupKind>,
}

// GET /fleet/report
async fn fleet_report(State(app): State<AppState>) -> Json<FleetReport> {
    Json(app.warden.monitor.fleet_report().await)
}

// GET /nodes
async fn list_nodes(State(app): State<AppState>) -> Json<Vec<NodeView>> {
    let stale_after = app.warden.config.monitor.stale_after_secs;
    let nodes = app.warden.catalog.list_nodes().await;
    Json(nodes.iter().map(|n| to_view(n, stale_after)).collect())
}

// POST /nodes
async fn register_node(State(app): State<AppState>, Json(body): Json<RegisterBody>) -> Result<(StatusCode, Json<NodeView>), ApiError> {
    if body.id.trim().is_empty() {
        return Err(WardenError::Config("node id must not be empty".into()).into());
    }
    let node = app.warden.catalog.register_node(Node::new(body.id, body.host)).await?;
    Ok((StatusCode::CREATED, Json(to_view(&node, app.warden.config.monitor.stale_after_secs))))
}

// GET /nodes/{id}
async fn get_node(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<NodeView> {
    let node = app.warden.catalog.require_node(&id).await?;
    Ok(Json(to_view(&node, app.warden.config.monitor.stale_after_secs)))
}

// DELETE /nodes/{id}
async fn retire_node(State(app): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let guard = app.warden.locks.acquire(&id).await;
    app.warden.catalog.retire_node(&id).await?;
    drop(guard);
    app.warden.locks.forget(&id);
    Ok(StatusCode::NO_CONTENT)
}

// GET /nodes/{id}/status
async fn latest_status(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusSummary> {
    app.warden
        .catalog
        .latest_status(&id)
        .await
        .map(Json)
        .ok_or_else(|| WardenError::NotFound(format!("node {id}")).into())
}

// GET /nodes/{id}/readiness
async fn readiness(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Readiness> {
    Ok(Json(app.warden.monitor.readiness(&id).await?))
}

// GET /nodes/{id}/diagnosis
async fn diagnosis(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Diagnosis> {
    Ok(Json(app.warden.strategist.diagnose(&id).await?))
}

// POST /nodes/{id}/check
async fn check_node(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<HealthResult> {
    app.warden.catalog.require_node(&id).await?;
    Ok(Json(app.warden.monitor.check_node(&id).await?))
}

// GET /nodes/{id}/backups?limit=
async fn list_backups(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<BackupRecord>> {
    app.warden.catalog.require_node(&id).await?;
    Ok(Json(app.warden.backups.list_backups(&id, params.limit).await))
}

// POST /nodes/{id}/backups
async fn create_backup(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<BackupBody>>,
) -> Result<(StatusCode, Json<BackupRecord>), ApiError> {
    app.warden.catalog.require_node(&id).await?;
    let kind = body.and_then(|Json(b)| b.kind).unwrap_or(BackupKind::Manual);
    let record = app.warden.backups.create_backup(&id, kind).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

// GET /nodes/{id}/restores?limit=
async fn list_restores(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<RestoreAttempt>> {
    app.warden.catalog.require_node(&id).await?;
    Ok(Json(app.warden.catalog.restore_attempts_for_node(&id, params.limit).await))
}

// POST /nodes/{id}/restore
async fn restore(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RestoreBody>,
) -> ApiResult<RecoveryReport> {
    app.warden.catalog.require_node(&id).await?;
    let outcome = app.warden.backups.restore_backup(&id, &body.backup_id).await?;
    Ok(Json(RecoveryReport::from(outcome)))
}

// POST /nodes/{id}/recover
async fn recover(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RecoverBody>>,
) -> ApiResult<RecoveryReport> {
    app.warden.catalog.require_node(&id).await?;
    let backup_id = body.and_then(|Json(b)| b.backup_id);
    Ok(Json(app.warden.strategist.recover(&id, backup_id.as_deref()).await?))
}

// POST /nodes/{id}/acknowledge
async fn acknowledge(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<HealthResult> {
    app.warden.catalog.require_node(&id).await?;
    Ok(Json(app.warden.monitor.acknowledge(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardenConfig;
    use crate::testkit::{FakeFleet, FakeNode};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    async fn app() -> (Router, FakeFleet, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WardenConfig::default();
        config.data_dir = dir.path().join("data");
        config.backup_dir = dir.path().join("backups");
        config.policy.verify_interval_secs = 0;
        config.policy.verify_settle_secs = 0;
        config.nodes.insert("pc-a".into(), HostRef::new("192.168.3.73", "openclaw01"));

        let fleet = FakeFleet::new(config.program.config_file.clone());
        fleet.add_node("pc-a", FakeNode::healthy());
        let warden = Warden::build(config, Arc::new(fleet.clone())).await.unwrap();
        (build_router(AppState::new(warden, Some("secret".into()))), fleet, dir)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> HttpRequest<Body> {
        let builder = HttpRequest::builder().method(method).uri(uri).header("x-api-key", "secret");
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (router, _fleet, _dir) = app().await;
        let response = router
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_is_required() {
        let (router, _fleet, _dir) = app().await;
        let response = router
            .oneshot(HttpRequest::builder().uri("/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_check_then_list_nodes() {
        let (router, _fleet, _dir) = app().await;
        let response = router.clone().oneshot(request("POST", "/nodes/pc-a/check", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["score"], 100);

        let response = router.oneshot(request("GET", "/nodes", None)).await.unwrap();
        let body = json(response).await;
        assert_eq!(body[0]["id"], "pc-a");
        assert_eq!(body[0]["status"], "healthy");
        assert_eq!(body[0]["stale"], false);
    }

    #[tokio::test]
    async fn test_latest_status_before_first_check() {
        let (router, _fleet, _dir) = app().await;
        let response = router.oneshot(request("GET", "/nodes/pc-a/status", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "unknown");
        assert!(body["last_checked"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_node_is_404() {
        let (router, _fleet, _dir) = app().await;
        let response = router.oneshot(request("GET", "/nodes/ghost/readiness", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_backup_and_restore_round_trip() {
        let (router, _fleet, _dir) = app().await;
        let response = router.clone().oneshot(request("POST", "/nodes/pc-a/backups", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let backup_id = json(response).await["id"].as_str().unwrap().to_string();

        let response = router
            .clone()
            .oneshot(request("POST", "/nodes/pc-a/restore", Some(serde_json::json!({ "backup_id": backup_id }))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json(response).await;
        assert_eq!(report["success"], true);
        assert_eq!(report["final_state"], "SUCCEEDED");
        assert_eq!(report["strategy"], "FULL_RESTORE");
        assert_eq!(report["backup_id"], backup_id.as_str());
        assert_eq!(report["verification"]["passed"], true);
        assert!(report["diagnosis"].is_null());
        assert!(!report["log"].as_array().unwrap().is_empty());

        let response = router.oneshot(request("GET", "/nodes/pc-a/restores?limit=5", None)).await.unwrap();
        assert_eq!(json(response).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_and_retire() {
        let (router, _fleet, _dir) = app().await;
        let response = router
            .clone()
            .oneshot(request("POST", "/nodes", Some(serde_json::json!({ "id": "t440", "host": "192.168.3.33", "user": "linou" }))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router.clone().oneshot(request("DELETE", "/nodes/t440", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router.oneshot(request("GET", "/nodes/t440", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
