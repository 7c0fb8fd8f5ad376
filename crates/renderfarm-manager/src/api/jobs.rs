use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use renderfarm_protocol::{CreateJobRequest, JobDto, JobStatus, JobUpdateRequest};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;
use crate::media::MediaStore;
use crate::signals::{self, Cause};
use crate::store::JobFilter;

#[derive(Debug, Deserialize)]
pub(crate) struct JobQuery {
    status: Option<String>,
    #[serde(rename = "assigned_worker__isnull")]
    assigned_worker_isnull: Option<bool>,
    gpu_available: Option<bool>,
}

impl JobQuery {
    fn filter(&self) -> Result<JobFilter, ApiError> {
        let status = match &self.status {
            Some(raw) => Some(raw.parse::<JobStatus>().map_err(ApiError::Validation)?),
            None => None,
        };
        Ok(JobFilter {
            status,
            unassigned_only: self.assigned_worker_isnull.unwrap_or(false),
            gpu_available: self.gpu_available,
        })
    }
}

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobDto>), ApiError> {
    let dto = state.store().create_job(req)?;
    tracing::info!(job = dto.id, name = %dto.name, "job submitted");
    Ok((StatusCode::CREATED, Json(dto)))
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Json<Vec<JobDto>>, ApiError> {
    let filter = query.filter()?;
    Ok(Json(state.store().list_jobs(filter)))
}

pub(crate) async fn get(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<JobDto>, ApiError> {
    Ok(Json(state.store().get_job(id)?))
}

pub(crate) async fn update(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(update): Json<JobUpdateRequest>,
) -> Result<Json<JobDto>, ApiError> {
    let (dto, effects) = state.store().update_job(id, update, Cause::External)?;
    signals::run_effects(&state, effects).await;
    Ok(Json(dto))
}

pub(crate) async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<JobDto>, ApiError> {
    let (dto, effects) = state.store().cancel_job(id)?;
    tracing::info!(job = id, "job canceled");
    signals::run_effects(&state, effects).await;
    Ok(Json(dto))
}

pub(crate) async fn upload_output(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    mut multipart: Multipart,
) -> Result<Json<JobDto>, ApiError> {
    let mut payload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Validation(format!("bad multipart body: {err}")))?
    {
        if field.name() == Some("output_file") {
            let filename = field
                .file_name()
                .unwrap_or("output.png")
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or("output.png")
                .to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|err| ApiError::Validation(format!("bad output_file field: {err}")))?;
            payload = Some((filename, bytes.to_vec()));
        }
    }
    let (filename, bytes) =
        payload.ok_or_else(|| ApiError::Validation("missing output_file field".to_string()))?;

    let (project, dir) = state.store().job_output_dir(id)?;
    let rel = MediaStore::job_output_rel(project, &dir, &filename);
    let abs = state.media().abs(&rel);
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(ApiError::internal)?;
    }
    tokio::fs::write(&abs, &bytes)
        .await
        .map_err(ApiError::internal)?;

    let (_, effects) = state.store().attach_job_output(id, rel)?;
    signals::run_effects(&state, effects).await;

    // Re-read so the response carries whatever the aggregator attached
    // (thumbnail, parent-driven state).
    Ok(Json(state.store().get_job(id)?))
}
