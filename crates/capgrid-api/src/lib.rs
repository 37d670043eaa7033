//! capgrid-api: REST API for the capgrid controller.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/status` | Pools, nodes, policy summary |
//! | GET | `/api/v1/nodes` | List node records |
//! | GET | `/api/v1/nodes/{id}` | One node record |
//! | POST | `/api/v1/nodes/{id}/drain` | Manual drain (`?force=&grace_secs=`) |
//! | POST | `/api/v1/nodes/{id}/interruption` | Reclaim notice |
//! | PUT | `/api/v1/nodes/{id}/workloads` | Report assigned workloads |
//! | POST | `/api/v1/nodes/{id}/utilization` | Report a utilization sample |
//! | POST | `/api/v1/nodes/{id}/ready` | Node joined the cluster |
//! | PUT | `/api/v1/workloads/pending` | Replace the pending workload set |
//! | POST | `/api/v1/reconcile` | Run a reconcile pass (`?dry_run=`) |
//! | GET | `/api/v1/events` | Event replay (`?since=&limit=`) |
//! | GET | `/api/v1/policy/resolve` | Traffic policy resolution |
//! | GET | `/api/v1/policy/ingress` | Gateway decision for a host |
//! | POST | `/api/v1/policy/reload` | Reload the policy document |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::path::PathBuf;

use axum::Router;
use axum::routing::{get, post, put};
use capgrid_controller::Controller;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Controller,
    /// Document read by `POST /policy/reload`.
    pub policy_path: Option<PathBuf>,
}

/// Build the complete API router.
pub fn build_router(controller: Controller, policy_path: Option<PathBuf>) -> Router {
    let api_state = ApiState {
        controller,
        policy_path,
    };

    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", get(handlers::get_node))
        .route("/nodes/{id}/drain", post(handlers::drain_node))
        .route("/nodes/{id}/interruption", post(handlers::interruption))
        .route("/nodes/{id}/workloads", put(handlers::report_workloads))
        .route("/nodes/{id}/utilization", post(handlers::report_utilization))
        .route("/nodes/{id}/ready", post(handlers::mark_ready))
        .route("/workloads/pending", put(handlers::report_pending))
        .route("/reconcile", post(handlers::reconcile))
        .route("/events", get(handlers::events))
        .route("/policy/resolve", get(handlers::resolve_policy))
        .route("/policy/ingress", get(handlers::ingress))
        .route("/policy/reload", post(handlers::reload_policy))
        .with_state(api_state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(api_state))
}
