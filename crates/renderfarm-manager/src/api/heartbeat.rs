use axum::Json;
use axum::extract::State;
use renderfarm_protocol::{HeartbeatRequest, WorkerDto};

use crate::AppState;
use crate::error::ApiError;

pub(crate) async fn beat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<WorkerDto>, ApiError> {
    let registering = req.available_tools.is_some();
    let dto = state.store().heartbeat(req)?;
    if registering {
        tracing::info!(worker = dto.id, hostname = %dto.hostname, "worker registered");
    }
    Ok(Json(dto))
}

pub(crate) async fn list(State(state): State<AppState>) -> Json<Vec<WorkerDto>> {
    Json(state.store().list_workers())
}
