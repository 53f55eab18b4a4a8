use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::ApiResult;
use crate::agent::{Agent, AgentCaps, AgentLogEvent, AgentUpdate, Trigger};
use crate::hooks::HookKind;
use crate::orchestrator::Orchestrator;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentBody {
    pub name: String,
    pub master_prompt: String,
    #[serde(default)]
    pub hook_events: Vec<HookKind>,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub caps: Option<AgentCaps>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectBody {
    pub project_path: String,
    pub session_id: String,
    pub branch_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /agents`
pub async fn list(State(o): State<Arc<Orchestrator>>) -> Json<Vec<Agent>> {
    Json(o.agents.list().await)
}

/// `POST /agents`
pub async fn create(
    State(o): State<Arc<Orchestrator>>,
    Json(body): Json<CreateAgentBody>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    let agent = Agent::new(
        body.name,
        body.master_prompt,
        body.hook_events,
        body.auto_approve,
        body.caps.unwrap_or_default(),
    );
    let agent = o.agents.create(agent).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// `GET /agents/:id`
pub async fn get_one(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(o.agents.get(&id).await?))
}

/// `PUT /agents/:id`
pub async fn update(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Json(body): Json<AgentUpdate>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(o.agents.update(&id, body).await?))
}

/// `DELETE /agents/:id`
pub async fn remove(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    o.delete_agent(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /agents/:id/start`
pub async fn start(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    o.agents.get(&id).await?;
    let runtime = o.runtimes.get_or_create(&id);
    Ok(Json(runtime.start().await?))
}

/// `POST /agents/:id/stop`
pub async fn stop(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    o.agents.get(&id).await?;
    let runtime = o.runtimes.get_or_create(&id);
    Ok(Json(runtime.stop().await?))
}

/// `POST /agents/:id/pause`
pub async fn pause(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    o.agents.get(&id).await?;
    let runtime = o.runtimes.get_or_create(&id);
    Ok(Json(runtime.pause().await?))
}

/// `POST /agents/:id/resume`
pub async fn resume(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    o.agents.get(&id).await?;
    let runtime = o.runtimes.get_or_create(&id);
    Ok(Json(runtime.resume().await?))
}

/// `POST /agents/:id/trigger` — manual wake-up, fire-and-forget.
pub async fn trigger(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    o.agents.get(&id).await?;
    let runtime = o.runtimes.get_or_create(&id);
    runtime.trigger(Trigger::manual());
    Ok(StatusCode::ACCEPTED)
}

/// `POST /agents/:id/connect`
pub async fn connect(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Json(body): Json<ConnectBody>,
) -> ApiResult<Json<Agent>> {
    let agent = o
        .connect_agent(&id, &body.project_path, &body.session_id, &body.branch_id)
        .await?;
    Ok(Json(agent))
}

/// `POST /agents/:id/disconnect`
pub async fn disconnect(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(o.disconnect_agent(&id).await?))
}

/// `GET /agents/:id/status` — live snapshot (status, counters, history).
pub async fn status(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent = o.agents.get(&id).await?;
    let connected = agent.connection.is_some();
    Ok(Json(serde_json::json!({
        "agent": agent,
        "connected": connected,
    })))
}

/// `GET /agents/:id/logs`
pub async fn logs(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<AgentLogEvent>>> {
    o.agents.get(&id).await?;
    let runtime = o.runtimes.get_or_create(&id);
    Ok(Json(runtime.event_log().recent(query.limit.unwrap_or(200))))
}

/// `DELETE /agents/:id/logs`
pub async fn clear_logs(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    o.agents.get(&id).await?;
    let runtime = o.runtimes.get_or_create(&id);
    runtime.event_log().clear();
    Ok(StatusCode::NO_CONTENT)
}
