#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Render farm manager: the job queue and dispatch API, parent decomposition,
//! result aggregation, tile assembly, and thumbnailing.
//!
//! The binary in `main.rs` is a thin shell; everything testable is reachable
//! through [`app`] + [`AppState`].

mod api;
mod assembler;
mod decompose;
mod error;
mod media;
mod models;
mod signals;
mod store;
mod thumbs;

use std::sync::{Arc, Mutex, MutexGuard};

pub use media::MediaStore;

use crate::store::Store;

/// Shared handler state: the entity store behind its lock, plus the media
/// root. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    store: Mutex<Store>,
    media: MediaStore,
}

impl AppState {
    pub fn new(media: MediaStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(Store::new()),
                media,
            }),
        }
    }

    pub(crate) fn store(&self) -> MutexGuard<'_, Store> {
        // A poisoned lock only means another handler panicked mid-request;
        // the store itself is still usable.
        self.inner
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn media(&self) -> &MediaStore {
        &self.inner.media
    }
}

/// Build the full HTTP surface for the given state.
pub fn app(state: AppState) -> axum::Router {
    api::router(state)
}
