use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::ApiResult;
use crate::orchestrator::Orchestrator;
use crate::project::{decode_path_token, Project};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// `GET /projects`
pub async fn list(State(o): State<Arc<Orchestrator>>) -> Json<Vec<Project>> {
    Json(o.projects.list().await)
}

/// `POST /projects`
pub async fn register(
    State(o): State<Arc<Orchestrator>>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project = o.projects.register(&body.path, body.name).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// `DELETE /projects/:encodedPath` — catalog entry only; the working
/// tree and any persisted session state stay on disk.
pub async fn unregister(
    State(o): State<Arc<Orchestrator>>,
    Path(encoded): Path<String>,
) -> ApiResult<StatusCode> {
    let path = decode_path_token(&encoded)?;
    o.projects.unregister(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}
