use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use renderfarm_protocol::AssetDto;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::media::MediaStore;

struct AssetUpload {
    name: String,
    project: Uuid,
    bytes: Vec<u8>,
}

async fn read_upload(mut multipart: Multipart) -> Result<AssetUpload, ApiError> {
    let mut name = None;
    let mut project = None;
    let mut bytes = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Validation(format!("bad multipart body: {err}")))?
    {
        match field.name() {
            Some("name") => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| ApiError::Validation(format!("bad name field: {err}")))?,
                );
            }
            Some("project") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| ApiError::Validation(format!("bad project field: {err}")))?;
                project = Some(
                    raw.parse::<Uuid>()
                        .map_err(|_| ApiError::Validation(format!("invalid project id {raw:?}")))?,
                );
            }
            Some("blend_file") => {
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|err| ApiError::Validation(format!("bad blend_file field: {err}")))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    Ok(AssetUpload {
        name: name.ok_or_else(|| ApiError::Validation("missing name field".to_string()))?,
        project: project.ok_or_else(|| ApiError::Validation("missing project field".to_string()))?,
        bytes: bytes.ok_or_else(|| ApiError::Validation("missing blend_file field".to_string()))?,
    })
}

pub(crate) async fn create(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<AssetDto>), ApiError> {
    let upload = read_upload(multipart).await?;

    let rel = MediaStore::asset_rel(upload.project);
    let abs = state.media().abs(&rel);
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(ApiError::internal)?;
    }
    tokio::fs::write(&abs, &upload.bytes)
        .await
        .map_err(ApiError::internal)?;

    let result = state
        .store()
        .create_asset(upload.project, &upload.name, rel.clone());
    match result {
        Ok(dto) => Ok((StatusCode::CREATED, Json(dto))),
        Err(err) => {
            // Keep the media tree consistent with the store.
            let _ = tokio::fs::remove_file(&abs).await;
            Err(err.into())
        }
    }
}

pub(crate) async fn get(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<AssetDto>, ApiError> {
    Ok(Json(state.store().get_asset(id)?))
}

pub(crate) async fn download(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let rel = state.store().asset_blob_rel(id)?;
    let bytes = tokio::fs::read(state.media().abs(&rel))
        .await
        .map_err(|_| ApiError::NotFound("asset blob"))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

pub(crate) async fn remove(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let rel = state.store().asset_blob_rel(id)?;
    state.store().delete_asset(id)?;
    let _ = tokio::fs::remove_file(state.media().abs(&rel)).await;
    Ok(StatusCode::NO_CONTENT)
}
