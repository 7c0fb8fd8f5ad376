//! Route table and handler modules.

mod animations;
mod assets;
mod heartbeat;
mod jobs;
mod media_files;
mod projects;
mod tiled;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};

use crate::AppState;

// Scene files and render outputs can be large.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/projects", post(projects::create).get(projects::list))
        .route("/api/projects/:id/pause", post(projects::pause))
        .route("/api/projects/:id/unpause", post(projects::unpause))
        .route("/api/projects/:id", delete(projects::remove))
        .route("/api/assets", post(assets::create))
        .route("/api/assets/:id", get(assets::get).delete(assets::remove))
        .route("/api/assets/:id/download", get(assets::download))
        .route("/api/jobs", post(jobs::create).get(jobs::list))
        .route("/api/jobs/:id", get(jobs::get).patch(jobs::update))
        .route("/api/jobs/:id/cancel", post(jobs::cancel))
        .route("/api/jobs/:id/upload_output", post(jobs::upload_output))
        .route("/api/animations", post(animations::create))
        .route("/api/animations/:id", get(animations::get))
        .route("/api/animations/:id/frames", get(animations::frames))
        .route("/api/animations/:id/cancel", post(animations::cancel))
        .route("/api/tiled-jobs", post(tiled::create))
        .route("/api/tiled-jobs/:id", get(tiled::get))
        .route("/api/heartbeat", post(heartbeat::beat).get(heartbeat::list))
        .route("/media/*path", get(media_files::serve))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}
