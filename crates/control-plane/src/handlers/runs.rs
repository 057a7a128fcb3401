//! Run lifecycle endpoints.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::compiler::{lower, WorkflowDocument};
use crate::db::StoredRun;
use crate::error::{AppError, AppResult};
use crate::execir::ExecProgram;
use crate::state::AppState;

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Body of `POST /api/runs`. Exactly one of `document` or `program`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    #[serde(default)]
    pub document: Option<WorkflowDocument>,

    #[serde(default)]
    pub program: Option<ExecProgram>,

    #[serde(default = "empty_object")]
    pub ctx: Value,

    #[serde(default = "empty_object")]
    pub input: Value,
}

/// Body of `POST /api/runs/{run_id}/resume`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRunRequest {
    #[serde(default = "empty_object")]
    pub ctx: Value,

    #[serde(default = "empty_object")]
    pub input: Value,
}

/// `POST /api/runs`
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> AppResult<(StatusCode, Json<StoredRun>)> {
    let program = match (request.document, request.program) {
        (Some(document), None) => lower(&document)?,
        (None, Some(program)) => program,
        (Some(_), Some(_)) => {
            return Err(AppError::BadRequest(
                "provide either a document or a program, not both".to_string(),
            ))
        }
        (None, None) => {
            return Err(AppError::BadRequest(
                "a document or a program is required".to_string(),
            ))
        }
    };
    if program.node(&program.entry_node).is_none() {
        return Err(AppError::BadRequest(format!(
            "entry node {} is not in the program",
            program.entry_node
        )));
    }

    let run = state
        .runs
        .start_run(program, request.ctx, request.input)
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// `GET /api/runs/{run_id}`
pub async fn get(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> AppResult<Json<StoredRun>> {
    Ok(Json(state.runs.get_run(&run_id).await?))
}

/// `POST /api/runs/{run_id}/resume`
///
/// Only waiting runs can be resumed; anything else is a `409`. The body is
/// optional.
pub async fn resume(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Bytes,
) -> AppResult<Json<StoredRun>> {
    let request: ResumeRunRequest = if body.is_empty() {
        ResumeRunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("invalid resume body: {e}")))?
    };
    let run = state
        .runs
        .resume_run(&run_id, request.ctx, request.input)
        .await?;
    Ok(Json(run))
}

/// `POST /api/runs/{run_id}/cancel`
pub async fn cancel(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> AppResult<Json<StoredRun>> {
    Ok(Json(state.runs.cancel_run(&run_id).await?))
}
