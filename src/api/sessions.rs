use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::ApiResult;
use crate::error::HelmError;
use crate::orchestrator::Orchestrator;
use crate::project::decode_path_token;
use crate::session::{Branch, Session};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateForkBody {
    pub name: String,
    pub parent_branch_id: String,
    #[serde(default)]
    pub vertical: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBody {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectBody {
    pub branch_id: String,
}

/// Checks the session belongs to the project named in the URL.
async fn scoped_session(
    o: &Orchestrator,
    encoded_path: &str,
    session_id: &str,
) -> Result<Session, HelmError> {
    let path = decode_path_token(encoded_path)?;
    let session = o.sessions.get_session(session_id).await?;
    if session.project_path != path {
        return Err(HelmError::not_found(format!("session '{}'", session_id)));
    }
    Ok(session)
}

/// `GET /projects/:p/sessions`
pub async fn list(
    State(o): State<Arc<Orchestrator>>,
    Path(encoded): Path<String>,
) -> ApiResult<Json<Vec<Session>>> {
    let path = decode_path_token(&encoded)?;
    o.projects.require(&path).await?;
    Ok(Json(o.sessions.list_sessions(&path).await))
}

/// `POST /projects/:p/sessions`
pub async fn create(
    State(o): State<Arc<Orchestrator>>,
    Path(encoded): Path<String>,
    body: Result<Json<CreateSessionBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let path = decode_path_token(&encoded)?;
    // A missing body means "name this session yourself".
    let name = body.ok().and_then(|Json(b)| b.name);
    let session = o.sessions.create_session(&path, name).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `GET /projects/:p/sessions/:id`
pub async fn get_one(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id)): Path<(String, String)>,
) -> ApiResult<Json<Session>> {
    Ok(Json(scoped_session(&o, &encoded, &id).await?))
}

/// `POST /projects/:p/sessions/:id/resume`
pub async fn resume(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id)): Path<(String, String)>,
) -> ApiResult<Json<Session>> {
    let path = decode_path_token(&encoded)?;
    Ok(Json(o.sessions.resume_session(&path, &id).await?))
}

/// `POST /projects/:p/sessions/:id/detach`
pub async fn detach(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id)): Path<(String, String)>,
) -> ApiResult<Json<Session>> {
    scoped_session(&o, &encoded, &id).await?;
    Ok(Json(o.sessions.detach_session(&id).await?))
}

/// `DELETE /projects/:p/sessions/:id`
pub async fn close(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id)): Path<(String, String)>,
) -> ApiResult<Json<Session>> {
    scoped_session(&o, &encoded, &id).await?;
    Ok(Json(o.sessions.close_session(&id).await?))
}

/// `POST /projects/:p/sessions/:id/reconcile`
pub async fn reconcile(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id)): Path<(String, String)>,
) -> ApiResult<Json<Session>> {
    scoped_session(&o, &encoded, &id).await?;
    Ok(Json(o.sessions.reconcile(&id).await?))
}

/// `POST /projects/:p/sessions/:id/forks`
pub async fn create_fork(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id)): Path<(String, String)>,
    Json(body): Json<CreateForkBody>,
) -> ApiResult<(StatusCode, Json<Branch>)> {
    scoped_session(&o, &encoded, &id).await?;
    let branch = o
        .sessions
        .create_fork(&id, &body.parent_branch_id, &body.name, body.vertical.unwrap_or(false))
        .await?;
    Ok((StatusCode::CREATED, Json(branch)))
}

/// `POST /projects/:p/sessions/:id/forks/:branchId/merge`
pub async fn merge_fork(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id, branch_id)): Path<(String, String, String)>,
) -> ApiResult<Json<Branch>> {
    scoped_session(&o, &encoded, &id).await?;
    Ok(Json(o.sessions.merge_fork(&id, &branch_id).await?))
}

/// `POST /projects/:p/sessions/:id/forks/:branchId/export`
pub async fn export_fork(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id, branch_id)): Path<(String, String, String)>,
    body: Result<Json<ExportBody>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    scoped_session(&o, &encoded, &id).await?;
    let name = body.ok().and_then(|Json(b)| b.name);
    let path = o.sessions.export_fork(&id, &branch_id, name).await?;
    Ok(Json(serde_json::json!({ "path": path })))
}

/// `DELETE /projects/:p/sessions/:id/forks/:branchId`
pub async fn close_fork(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id, branch_id)): Path<(String, String, String)>,
) -> ApiResult<Json<Branch>> {
    scoped_session(&o, &encoded, &id).await?;
    Ok(Json(o.sessions.close_fork(&id, &branch_id).await?))
}

/// `POST /projects/:p/sessions/:id/select`
pub async fn select_branch(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id)): Path<(String, String)>,
    Json(body): Json<SelectBody>,
) -> ApiResult<StatusCode> {
    scoped_session(&o, &encoded, &id).await?;
    o.sessions.select_branch(&id, &body.branch_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /projects/:p/sessions/:id/active-branch`
pub async fn active_branch(
    State(o): State<Arc<Orchestrator>>,
    Path((encoded, id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    scoped_session(&o, &encoded, &id).await?;
    let branch = o.sessions.active_branch(&id).await?;
    Ok(Json(serde_json::json!({ "branchId": branch.id })))
}
