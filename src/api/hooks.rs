use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use super::ApiResult;
use crate::hooks::HookEvent;
use crate::orchestrator::Orchestrator;

/// `POST /hooks` — trigger sink for the AI CLI's hook scripts.
///
/// Accepts without blocking on agent work: routing enqueues coalesced
/// triggers and returns immediately.
pub async fn ingest(
    State(o): State<Arc<Orchestrator>>,
    Json(event): Json<HookEvent>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let delivered = o.hooks.ingest(event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "delivered": delivered })),
    ))
}
