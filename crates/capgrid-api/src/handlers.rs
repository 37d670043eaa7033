//! REST API handlers.
//!
//! Each handler delegates to the `Controller` and returns JSON wrapped in
//! `ApiResponse`.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use capgrid_controller::ControlError;
use capgrid_disruption::{DisruptionError, DrainStart};
use capgrid_policy::RequestContext;
use capgrid_state::{
    AssignedWorkload, PendingWorkload, StateError, UtilizationSample, WorkloadClass, epoch_secs,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn control_error(err: ControlError) -> Response {
    let status = match &err {
        ControlError::NodeNotFound(_)
        | ControlError::State(StateError::NotFound(_))
        | ControlError::Disruption(DisruptionError::NodeNotFound(_)) => StatusCode::NOT_FOUND,
        ControlError::Config(_) if err.is_validation() => StatusCode::UNPROCESSABLE_ENTITY,
        _ if err.is_validation() => StatusCode::CONFLICT,
        _ => {
            warn!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&err.to_string(), status)
}

fn respond<T: Serialize>(result: Result<T, ControlError>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => control_error(e),
    }
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.controller.status().await)
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.controller.state().list_nodes().map_err(ControlError::from))
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.controller.node(&id))
}

#[derive(Debug, Default, Deserialize)]
pub struct DrainParams {
    #[serde(default)]
    pub force: bool,
    /// Overrides the pool's disruption grace.
    #[serde(default)]
    pub grace_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct DrainResponse {
    pub node: String,
    pub outcome: &'static str,
}

fn drain_response(node: String, outcome: DrainStart) -> Response {
    let outcome = match outcome {
        DrainStart::Started => "started",
        DrainStart::AlreadyDraining => "already_draining",
        DrainStart::Tightened => "tightened",
        DrainStart::NotDrainable(state) => {
            return error_response(
                &format!("node {node} is {state} and cannot drain"),
                StatusCode::CONFLICT,
            );
        }
    };
    ApiResponse::ok(DrainResponse { node, outcome }).into_response()
}

/// POST /api/v1/nodes/{id}/drain
pub async fn drain_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<DrainParams>,
) -> impl IntoResponse {
    let grace = params.grace_secs.map(Duration::from_secs);
    match state.controller.manual_drain(&id, params.force, grace).await {
        Ok(outcome) => drain_response(id, outcome),
        Err(e) => control_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct InterruptionRequest {
    pub deadline_secs: u64,
}

/// POST /api/v1/nodes/{id}/interruption
pub async fn interruption(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<InterruptionRequest>,
) -> impl IntoResponse {
    let deadline = Duration::from_secs(req.deadline_secs);
    match state.controller.interruption(&id, deadline).await {
        Ok(outcome) => drain_response(id, outcome),
        Err(e) => control_error(e),
    }
}

/// PUT /api/v1/nodes/{id}/workloads
pub async fn report_workloads(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(workloads): Json<Vec<AssignedWorkload>>,
) -> impl IntoResponse {
    respond(state.controller.report_workloads(&id, workloads))
}

#[derive(Debug, Deserialize)]
pub struct UtilizationRequest {
    pub cpu: f64,
    pub memory: f64,
    /// Defaults to the time of receipt.
    #[serde(default)]
    pub sampled_at: Option<u64>,
}

/// POST /api/v1/nodes/{id}/utilization
pub async fn report_utilization(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<UtilizationRequest>,
) -> impl IntoResponse {
    let in_range = |v: f64| (0.0..=1.0).contains(&v);
    if !in_range(req.cpu) || !in_range(req.memory) {
        return error_response(
            "utilization fractions must be between 0 and 1",
            StatusCode::BAD_REQUEST,
        );
    }
    let sample = UtilizationSample {
        cpu: req.cpu,
        memory: req.memory,
        sampled_at: req.sampled_at.unwrap_or_else(epoch_secs),
    };
    respond(state.controller.report_utilization(&id, sample))
}

/// POST /api/v1/nodes/{id}/ready
pub async fn mark_ready(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.controller.mark_ready(&id))
}

// ── Workloads ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub pending: usize,
}

/// PUT /api/v1/workloads/pending
pub async fn report_pending(
    State(state): State<ApiState>,
    Json(workloads): Json<Vec<PendingWorkload>>,
) -> impl IntoResponse {
    respond(
        state
            .controller
            .report_pending(&workloads)
            .map(|pending| PendingResponse { pending }),
    )
}

// ── Reconcile ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileParams {
    #[serde(default)]
    pub dry_run: bool,
}

/// POST /api/v1/reconcile
pub async fn reconcile(
    State(state): State<ApiState>,
    Query(params): Query<ReconcileParams>,
) -> impl IntoResponse {
    respond(state.controller.reconcile_once(params.dry_run).await)
}

// ── Events ─────────────────────────────────────────────────────

const MAX_EVENTS: usize = 1000;

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    #[serde(default)]
    pub since: u64,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// GET /api/v1/events
pub async fn events(
    State(state): State<ApiState>,
    Query(params): Query<EventsParams>,
) -> impl IntoResponse {
    respond(
        state
            .controller
            .events(params.since, params.limit.min(MAX_EVENTS)),
    )
}

// ── Policy ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResolveParams {
    pub source: String,
    pub dest: String,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub class: Option<WorkloadClass>,
}

/// GET /api/v1/policy/resolve
pub async fn resolve_policy(
    State(state): State<ApiState>,
    Query(params): Query<ResolveParams>,
) -> impl IntoResponse {
    let effective = state.controller.resolve_request(&RequestContext {
        source_namespace: &params.source,
        source_identity: params.identity.as_deref(),
        dest_namespace: &params.dest,
        dest_class: params.class,
    });
    ApiResponse::ok(effective).into_response()
}

#[derive(Debug, Deserialize)]
pub struct IngressParams {
    pub host: String,
}

/// GET /api/v1/policy/ingress
pub async fn ingress(
    State(state): State<ApiState>,
    Query(params): Query<IngressParams>,
) -> impl IntoResponse {
    ApiResponse::ok(state.controller.ingress(&params.host)).into_response()
}

/// POST /api/v1/policy/reload
pub async fn reload_policy(State(state): State<ApiState>) -> impl IntoResponse {
    let Some(path) = state.policy_path.as_deref() else {
        return error_response("no policy document configured", StatusCode::BAD_REQUEST);
    };
    respond(state.controller.reload(path))
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    match state.controller.metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => control_error(e),
    }
}
