use axum::{
    extract::{rejection::JsonRejection, Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use nectar_common::JobStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::DispatchError;
use crate::jobs::JobFilter;
use crate::matcher::Preference;
use crate::websocket::ws_handler;
use crate::workers::WorkerFilter;

type ApiResult = Result<Response, DispatchError>;

/// HTTP + WebSocket front of the coordinator
pub struct ApiServer {
    coordinator: Arc<Coordinator>,
}

impl ApiServer {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn routes(self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/ws", get(ws_handler))
            .route("/api/jobs", get(list_jobs))
            .route("/api/jobs/:id", get(get_job))
            .route("/api/jobs/:id/assign", post(assign_job))
            .route("/api/jobs/:id/start", post(start_job))
            .route("/api/jobs/:id/complete", post(complete_job))
            .route("/api/jobs/:id/fail", post(fail_job))
            .route("/api/workers", get(list_workers).post(register_worker))
            .route("/api/workers/:id", get(get_worker).delete(remove_worker))
            .route("/api/workers/:id/heartbeat", post(heartbeat))
            .route("/api/workers/:id/status", post(set_status))
            .route("/api/workers/:id/capabilities", put(update_capabilities))
            .route("/api/workers/:id/jobs", get(worker_jobs))
            .route("/api/match", post(match_worker))
            .route("/api/leaderboard", get(leaderboard))
            .route("/api/stats", get(stats))
            .layer(CorsLayer::permissive())
            .with_state(self.coordinator)
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::JobNotFound(_) | DispatchError::WorkerNotFound(_) | DispatchError::NoMatch => {
                StatusCode::NOT_FOUND
            }
            DispatchError::IllegalTransition { .. }
            | DispatchError::NotAssigned { .. }
            | DispatchError::CapacityExceeded(_)
            | DispatchError::AlreadyAssigned { .. }
            | DispatchError::WorkerBusy { .. } => StatusCode::CONFLICT,
            DispatchError::EmptyFingerprint(_) | DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::Ledger(_) => StatusCode::BAD_GATEWAY,
        };
        debug!("Request failed ({}): {}", self.reason(), self);

        let body = json!({
            "success": false,
            "error": {
                "reason": self.reason(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

fn ok<T: Serialize>(data: T) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })).into_response())
}

/// Unwrap a JSON body, reporting malformed input in the standard envelope
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, DispatchError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| DispatchError::InvalidRequest(e.body_text()))
}

async fn health() -> ApiResult {
    ok(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now(),
    }))
}

// ---- jobs ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JobQuery {
    status: Option<String>,
    worker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkerRequest {
    worker: String,
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    worker: String,
    result_fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct FailRequest {
    worker: String,
    #[serde(default)]
    error: String,
}

async fn list_jobs(State(c): State<Arc<Coordinator>>, Query(q): Query<JobQuery>) -> ApiResult {
    let status = match q.status.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(s.parse::<JobStatus>().map_err(DispatchError::InvalidRequest)?),
        None => None,
    };
    let filter = JobFilter {
        status,
        worker: q.worker.filter(|w| !w.is_empty()),
    };
    ok(c.query_jobs(&filter).await)
}

async fn get_job(State(c): State<Arc<Coordinator>>, Path(id): Path<String>) -> ApiResult {
    ok(c.job(&id).await?)
}

async fn assign_job(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
    payload: Result<Json<WorkerRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    ok(c.force_assign(&id, &req.worker).await?)
}

async fn start_job(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
    payload: Result<Json<WorkerRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    ok(c.report_start(&id, &req.worker).await?)
}

async fn complete_job(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    ok(c.report_completion(&id, &req.worker, &req.result_fingerprint).await?)
}

async fn fail_job(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
    payload: Result<Json<FailRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let error = if req.error.is_empty() { "unspecified failure" } else { req.error.as_str() };
    ok(c.report_failure(&id, &req.worker, error).await?)
}

// ---- workers -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WorkerQuery {
    status: Option<String>,
    capability: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    address: String,
    /// Either a raw string or any JSON value, which is stored serialized
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    online: bool,
}

#[derive(Debug, Deserialize)]
struct CapabilitiesRequest {
    capabilities: Vec<String>,
}

async fn list_workers(State(c): State<Arc<Coordinator>>, Query(q): Query<WorkerQuery>) -> ApiResult {
    let mut filter = WorkerFilter {
        capability: q.capability.filter(|cap| !cap.is_empty()),
        ..WorkerFilter::default()
    };
    match q.status.as_deref() {
        None | Some("") | Some("all") => {}
        Some("online") => filter.online_only = true,
        Some("available") => filter.available_only = true,
        Some(other) => {
            return Err(DispatchError::InvalidRequest(format!("unknown worker status {:?}", other)))
        }
    }
    ok(c.query_workers(&filter).await)
}

async fn register_worker(
    State(c): State<Arc<Coordinator>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let metadata = match req.metadata {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    ok(c.register_worker(&req.address, &metadata).await?)
}

async fn get_worker(State(c): State<Arc<Coordinator>>, Path(id): Path<String>) -> ApiResult {
    ok(c.worker(&id).await?)
}

async fn remove_worker(State(c): State<Arc<Coordinator>>, Path(id): Path<String>) -> ApiResult {
    ok(c.remove_worker(&id).await?)
}

async fn heartbeat(State(c): State<Arc<Coordinator>>, Path(id): Path<String>) -> ApiResult {
    let worker = c.heartbeat(&id).await?;
    ok(json!({
        "address": worker.address,
        "online": worker.online,
        "last_seen": worker.last_seen,
    }))
}

async fn set_status(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    ok(c.set_online(&id, req.online).await?)
}

async fn update_capabilities(
    State(c): State<Arc<Coordinator>>,
    Path(id): Path<String>,
    payload: Result<Json<CapabilitiesRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    ok(c.update_capabilities(&id, &req.capabilities).await?)
}

async fn worker_jobs(State(c): State<Arc<Coordinator>>, Path(id): Path<String>) -> ApiResult {
    ok(c.worker_jobs(&id).await?)
}

// ---- matching & stats ----------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct MatchRequest {
    #[serde(default)]
    requirements: String,
    #[serde(default = "default_true")]
    prefer_high_rating: bool,
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

async fn match_worker(
    State(c): State<Arc<Coordinator>>,
    payload: Result<Json<MatchRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let preference = Preference::from_flag(req.prefer_high_rating);
    match c.find_best_worker(&req.requirements, preference).await {
        Some(worker) => ok(worker),
        None => Err(DispatchError::NoMatch),
    }
}

async fn leaderboard(State(c): State<Arc<Coordinator>>, Query(q): Query<LeaderboardQuery>) -> ApiResult {
    ok(c.top_workers(q.limit.unwrap_or(10).min(100)).await)
}

async fn stats(State(c): State<Arc<Coordinator>>) -> ApiResult {
    ok(c.stats().await)
}
