use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;

use crate::AppState;
use crate::error::ApiError;

/// Serve a blob under the media root. Paths are store-issued, but reject
/// traversal anyway since this is reachable with arbitrary input.
pub(crate) async fn serve(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if path.split('/').any(|seg| seg == ".." || seg.is_empty()) {
        return Err(ApiError::Validation("invalid media path".to_string()));
    }

    let abs = state.media().abs(&path);
    let bytes = tokio::fs::read(&abs)
        .await
        .map_err(|_| ApiError::NotFound("file"))?;

    let content_type = if path.ends_with(".png") {
        "image/png"
    } else {
        "application/octet-stream"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}
