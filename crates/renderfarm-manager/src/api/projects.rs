use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use renderfarm_protocol::{CreateProjectRequest, ProjectDto};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ProjectDto>), ApiError> {
    let dto = state.store().create_project(&req.name)?;
    Ok((StatusCode::CREATED, Json(dto)))
}

pub(crate) async fn list(State(state): State<AppState>) -> Json<Vec<ProjectDto>> {
    Json(state.store().list_projects())
}

pub(crate) async fn pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProjectDto>, ApiError> {
    let dto = state.store().set_project_paused(id, true)?;
    tracing::info!(project = %id, "project paused");
    Ok(Json(dto))
}

pub(crate) async fn unpause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProjectDto>, ApiError> {
    let dto = state.store().set_project_paused(id, false)?;
    tracing::info!(project = %id, "project unpaused");
    Ok(Json(dto))
}

pub(crate) async fn remove(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store().delete_project(id)?;
    Ok(StatusCode::NO_CONTENT)
}
