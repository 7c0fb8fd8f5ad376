//! Media-root filesystem layout.
//!
//! All blobs live under one configurable root:
//!
//! ```text
//! assets/<short-project-id>/<short-uuid>.blend
//! assets/<short-project-id>/outputs/job_<id>/<file>
//! assets/<short-project-id>/outputs/animation_<id>/<file>
//! assets/<short-project-id>/outputs/tiled-job_<short-id>/<file>
//! assets/<short-project-id>/thumbnails/<kind>_<pk>_thumbnail.png
//! ```
//!
//! Paths handed around the store are root-relative; the HTTP layer serves
//! them under `/media/<rel>`.

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// First 8 hex characters of a UUID, used for directory and blob names.
pub(crate) fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a root-relative blob path.
    pub fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// URL path a client uses to download a root-relative blob.
    pub fn url(rel: &str) -> String {
        format!("/media/{rel}")
    }

    pub(crate) fn asset_rel(project: Uuid) -> String {
        let blob = Uuid::new_v4();
        format!("assets/{}/{}.blend", short_id(project), short_id(blob))
    }

    pub(crate) fn job_output_rel(project: Uuid, job_dir: &str, filename: &str) -> String {
        format!("assets/{}/outputs/{job_dir}/{filename}", short_id(project))
    }

    pub(crate) fn thumbnail_rel(project: Uuid, kind: &str, pk: &str) -> String {
        format!("assets/{}/thumbnails/{kind}_{pk}_thumbnail.png", short_id(project))
    }

    /// Write a blob, creating parent directories as needed.
    pub(crate) fn write(&self, rel: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.abs(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)
    }

    /// Remove a blob if present. Missing files are not an error.
    pub(crate) fn remove(&self, rel: &str) -> io::Result<()> {
        match std::fs::remove_file(self.abs(rel)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_documented_tree() {
        let project = Uuid::new_v4();
        let p8 = short_id(project);

        let asset = MediaStore::asset_rel(project);
        assert!(asset.starts_with(&format!("assets/{p8}/")));
        assert!(asset.ends_with(".blend"));

        let out = MediaStore::job_output_rel(project, "job_7", "frame_0001.png");
        assert_eq!(out, format!("assets/{p8}/outputs/job_7/frame_0001.png"));

        let thumb = MediaStore::thumbnail_rel(project, "job", "7");
        assert_eq!(thumb, format!("assets/{p8}/thumbnails/job_7_thumbnail.png"));
    }

    #[test]
    fn remove_tolerates_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let media = MediaStore::new(tmp.path()).unwrap();
        media.remove("assets/nope/missing.png").unwrap();
    }
}
