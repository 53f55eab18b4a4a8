//! HTTP/JSON API consumed by the web UI and the AI CLI's hook scripts.

mod agents;
mod hooks;
mod projects;
mod sessions;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::error::HelmError;
use crate::orchestrator::Orchestrator;

/// Error envelope: every failure carries a machine-readable string and a
/// status code derived from the error kind.
pub struct ApiError(pub HelmError);

impl From<HelmError> for ApiError {
    fn from(e: HelmError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HelmError::Validation(_) => StatusCode::BAD_REQUEST,
            HelmError::NotFound(_) => StatusCode::NOT_FOUND,
            HelmError::AlreadyExists(_) | HelmError::Conflict(_) => StatusCode::CONFLICT,
            HelmError::BackendUnavailable(_)
            | HelmError::Timeout(_)
            | HelmError::Exhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            HelmError::PolicyProtocol(_) => StatusCode::BAD_GATEWAY,
            HelmError::CorruptState(_)
            | HelmError::Cancelled
            | HelmError::Internal(_)
            | HelmError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Builds the full router over a shared orchestrator handle.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        // projects
        .route("/projects", get(projects::list).post(projects::register))
        .route("/projects/{encodedPath}", delete(projects::unregister))
        // sessions
        .route(
            "/projects/{encodedPath}/sessions",
            get(sessions::list).post(sessions::create),
        )
        .route(
            "/projects/{encodedPath}/sessions/{id}",
            get(sessions::get_one).delete(sessions::close),
        )
        .route(
            "/projects/{encodedPath}/sessions/{id}/resume",
            post(sessions::resume),
        )
        .route(
            "/projects/{encodedPath}/sessions/{id}/detach",
            post(sessions::detach),
        )
        .route(
            "/projects/{encodedPath}/sessions/{id}/reconcile",
            post(sessions::reconcile),
        )
        // forks
        .route(
            "/projects/{encodedPath}/sessions/{id}/forks",
            post(sessions::create_fork),
        )
        .route(
            "/projects/{encodedPath}/sessions/{id}/forks/{branchId}",
            delete(sessions::close_fork),
        )
        .route(
            "/projects/{encodedPath}/sessions/{id}/forks/{branchId}/merge",
            post(sessions::merge_fork),
        )
        .route(
            "/projects/{encodedPath}/sessions/{id}/forks/{branchId}/export",
            post(sessions::export_fork),
        )
        .route(
            "/projects/{encodedPath}/sessions/{id}/select",
            post(sessions::select_branch),
        )
        .route(
            "/projects/{encodedPath}/sessions/{id}/active-branch",
            get(sessions::active_branch),
        )
        // agents
        .route("/agents", get(agents::list).post(agents::create))
        .route(
            "/agents/{id}",
            get(agents::get_one).put(agents::update).delete(agents::remove),
        )
        .route("/agents/{id}/start", post(agents::start))
        .route("/agents/{id}/stop", post(agents::stop))
        .route("/agents/{id}/pause", post(agents::pause))
        .route("/agents/{id}/resume", post(agents::resume))
        .route("/agents/{id}/trigger", post(agents::trigger))
        .route("/agents/{id}/connect", post(agents::connect))
        .route("/agents/{id}/disconnect", post(agents::disconnect))
        .route("/agents/{id}/status", get(agents::status))
        .route(
            "/agents/{id}/logs",
            get(agents::logs).delete(agents::clear_logs),
        )
        // hook sink
        .route("/hooks", post(hooks::ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn healthz(State(orchestrator): State<Arc<Orchestrator>>) -> Json<serde_json::Value> {
    Json(orchestrator.health().await)
}
