use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use renderfarm_protocol::{CreateTiledJobRequest, TiledJobDto};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateTiledJobRequest>,
) -> Result<(StatusCode, Json<TiledJobDto>), ApiError> {
    let dto = state.store().create_tiled_job(req)?;
    tracing::info!(
        tiled_job = %dto.id,
        name = %dto.name,
        tiles = dto.tile_count_x * dto.tile_count_y,
        "tiled job submitted"
    );
    Ok((StatusCode::CREATED, Json(dto)))
}

pub(crate) async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TiledJobDto>, ApiError> {
    Ok(Json(state.store().get_tiled_job(id)?))
}
