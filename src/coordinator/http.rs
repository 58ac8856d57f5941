//! HTTP control API for the coordinator
//!
//! Leader endpoints follow the Marathon shape (`GET`/`DELETE /v2/leader`) so
//! existing tooling can probe and abdicate without changes. Members, volumes
//! and apps are exposed under the same prefix.

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{timestamp_now_millis, Error, MemberRole, METRICS};
use crate::coordinator::election::ElectionEngine;
use crate::coordinator::liveness::LeaderInfo;
use crate::coordinator::membership::MembershipStore;
use crate::volume::{VolumeManager, WorkloadManager, WorkloadSpec};
use axum::{
    error_handling::HandleErrorLayer,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct CoordState {
    pub node_id: String,
    pub membership: Arc<MembershipStore>,
    pub election: Arc<ElectionEngine>,
    pub volumes: Arc<VolumeManager>,
    pub workloads: Arc<WorkloadManager>,
}

/// Limits applied to every request
#[derive(Debug, Clone, Copy)]
pub struct RouterLimits {
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for RouterLimits {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = json!({
            "error": self.to_string(),
            "last_observed": self.last_observed(),
            "retryable": self.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, Error>;

pub fn create_router(state: CoordState, limits: RouterLimits) -> Router {
    Router::new()
        // Leader
        .route("/v2/leader", get(get_leader).delete(delete_leader))
        .route("/v2/leader/status", get(leader_status))
        .route("/v2/leader/history", get(leader_history))
        // Members
        .route("/v2/members", get(list_members))
        .route("/v2/members/:id", put(register_member).get(get_member))
        .route("/v2/members/:id/heartbeat", post(heartbeat))
        .route("/v2/members/:id/unreachable", post(mark_unreachable))
        // Volumes
        .route("/v2/volumes", get(list_volumes).post(create_volume))
        .route("/v2/volumes/:name", get(get_volume).delete(destroy_volume))
        .route("/v2/volumes/:name/attach", post(attach_volume))
        .route("/v2/volumes/:name/reattach", post(reattach_volume))
        .route("/v2/volumes/:name/detach", post(detach_volume))
        // Apps
        .route("/v2/apps", get(list_apps).post(deploy_app))
        .route("/v2/apps/:id", get(get_app).delete(remove_app))
        .route("/v2/apps/:id/scale", put(scale_app))
        .route("/v2/apps/:id/tasks", get(app_tasks))
        // Health and metrics
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route_layer(middleware::from_fn(request_tracing_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(HandleErrorLayer::new(handle_timeout))
                .timeout(limits.request_timeout)
                .layer(RequestBodyLimitLayer::new(limits.max_body_bytes)),
        )
        .with_state(state)
}

async fn handle_timeout(err: tower::BoxError) -> (StatusCode, Json<serde_json::Value>) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({ "error": "request timed out" })),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
    }
}

// === Leader ===

async fn get_leader(State(state): State<CoordState>) -> Response {
    match state.election.current_leader() {
        Some(leader) => Json(LeaderInfo {
            leader: leader.address,
            leader_id: Some(leader.id),
            term: Some(state.election.current_term()),
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "There is no leader" })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AbdicateParams {
    /// Leader the caller believes is current
    expected: Option<String>,
}

async fn delete_leader(
    State(state): State<CoordState>,
    Query(params): Query<AbdicateParams>,
) -> ApiResult<Response> {
    let Some(current) = state.election.status().leader_id else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "There is no leader" })),
        )
            .into_response());
    };

    let requested = params.expected.unwrap_or(current);
    let term = state.election.resign(&requested)?;
    Ok(Json(json!({
        "message": "Leadership abdicated",
        "leader": term.leader_id,
        "term": term.term,
    }))
    .into_response())
}

async fn leader_status(State(state): State<CoordState>) -> impl IntoResponse {
    Json(state.election.status())
}

async fn leader_history(State(state): State<CoordState>) -> impl IntoResponse {
    Json(state.election.history())
}

// === Members ===

async fn list_members(State(state): State<CoordState>) -> impl IntoResponse {
    Json(json!({
        "members": state.membership.list(),
        "partitions": state.membership.partitions(),
    }))
}

async fn get_member(
    State(state): State<CoordState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .membership
        .get(&id)
        .map(Json)
        .ok_or(Error::MemberNotFound(id))
}

#[derive(Debug, Deserialize)]
struct RegisterMember {
    address: String,
    #[serde(default = "default_register_role")]
    role: MemberRole,
}

fn default_register_role() -> MemberRole {
    MemberRole::LeaderEligible
}

async fn register_member(
    State(state): State<CoordState>,
    Path(id): Path<String>,
    Json(req): Json<RegisterMember>,
) -> ApiResult<impl IntoResponse> {
    crate::common::validate_name(&id)?;
    let member = state
        .membership
        .register(&id, &req.address, req.role, timestamp_now_millis());
    Ok(Json(member))
}

#[derive(Debug, Default, Deserialize)]
struct Heartbeat {
    timestamp_ms: Option<u64>,
}

async fn heartbeat(
    State(state): State<CoordState>,
    Path(id): Path<String>,
    body: Option<Json<Heartbeat>>,
) -> impl IntoResponse {
    let beat = body.map(|Json(beat)| beat).unwrap_or_default();
    state
        .membership
        .upsert_heartbeat(&id, beat.timestamp_ms.unwrap_or_else(timestamp_now_millis));
    StatusCode::NO_CONTENT
}

async fn mark_unreachable(
    State(state): State<CoordState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.membership.mark_unreachable(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// === Volumes ===

async fn list_volumes(State(state): State<CoordState>) -> impl IntoResponse {
    Json(json!({ "volumes": state.volumes.list() }))
}

#[derive(Debug, Deserialize)]
struct CreateVolume {
    name: String,
    /// Bind immediately, reusing an existing volume of the same name
    workload: Option<String>,
}

async fn create_volume(
    State(state): State<CoordState>,
    Json(req): Json<CreateVolume>,
) -> ApiResult<impl IntoResponse> {
    let volume = match req.workload {
        Some(workload) => state.volumes.create_or_reuse(&req.name, &workload)?,
        None => state.volumes.create(&req.name)?,
    };
    Ok((StatusCode::CREATED, Json(volume)))
}

async fn get_volume(
    State(state): State<CoordState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.volumes.get(&name)?))
}

#[derive(Debug, Deserialize)]
struct DestroyParams {
    /// Retry under the configured destroy policy while the device is held
    #[serde(default)]
    wait: bool,
}

async fn destroy_volume(
    State(state): State<CoordState>,
    Path(name): Path<String>,
    Query(params): Query<DestroyParams>,
) -> ApiResult<impl IntoResponse> {
    if params.wait {
        state.volumes.destroy_with_default_retry(&name).await?;
    } else {
        state.volumes.destroy(&name)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AttachVolume {
    workload: String,
}

async fn attach_volume(
    State(state): State<CoordState>,
    Path(name): Path<String>,
    Json(req): Json<AttachVolume>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.volumes.attach(&name, &req.workload)?))
}

async fn reattach_volume(
    State(state): State<CoordState>,
    Path(name): Path<String>,
    Json(req): Json<AttachVolume>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.volumes.reattach(&name, &req.workload)?))
}

async fn detach_volume(
    State(state): State<CoordState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.volumes.detach(&name)?))
}

// === Apps ===

async fn list_apps(State(state): State<CoordState>) -> impl IntoResponse {
    Json(json!({ "apps": state.workloads.list() }))
}

async fn deploy_app(
    State(state): State<CoordState>,
    Json(spec): Json<WorkloadSpec>,
) -> ApiResult<impl IntoResponse> {
    Ok((StatusCode::CREATED, Json(state.workloads.deploy(spec)?)))
}

async fn get_app(
    State(state): State<CoordState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.workloads.get(&id)?))
}

async fn remove_app(
    State(state): State<CoordState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.workloads.remove(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ScaleApp {
    instances: usize,
}

async fn scale_app(
    State(state): State<CoordState>,
    Path(id): Path<String>,
    Json(req): Json<ScaleApp>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.workloads.scale(&id, req.instances)?))
}

async fn app_tasks(
    State(state): State<CoordState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(json!({ "tasks": state.workloads.tasks(&id)? })))
}

// === Health ===

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    let status = state.election.status();
    Json(json!({
        "status": "ok",
        "node_id": state.node_id,
        "version": crate::VERSION,
        "election": status.state,
        "leader": status.leader_id,
        "uptime_seconds": METRICS.uptime_seconds(),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        METRICS.to_prometheus(),
    )
}
