use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use renderfarm_protocol::{AnimationDto, AnimationFrameDto, CreateAnimationRequest};

use crate::AppState;
use crate::error::ApiError;

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateAnimationRequest>,
) -> Result<(StatusCode, Json<AnimationDto>), ApiError> {
    let dto = state.store().create_animation(req)?;
    tracing::info!(
        animation = dto.id,
        name = %dto.name,
        frames = dto.total_frames,
        tiling = ?dto.tiling_config,
        "animation submitted"
    );
    Ok((StatusCode::CREATED, Json(dto)))
}

pub(crate) async fn get(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<AnimationDto>, ApiError> {
    Ok(Json(state.store().animation_dto(id)?))
}

pub(crate) async fn frames(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<AnimationFrameDto>>, ApiError> {
    Ok(Json(state.store().list_animation_frames(id)?))
}

pub(crate) async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<AnimationDto>, ApiError> {
    let dto = state.store().cancel_animation(id)?;
    tracing::info!(animation = id, "animation canceled");
    Ok(Json(dto))
}
