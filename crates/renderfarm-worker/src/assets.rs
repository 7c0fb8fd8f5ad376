//! Local mirror of manager-served scene files.
//!
//! Cache keys are the URL path of the blob (`/media/assets/<proj>/<id>.blend`
//! becomes `<cache>/media/assets/<proj>/<id>.blend`), so the server-assigned
//! content-addressed name carries over unchanged. Files are immutable once
//! present; a concurrent double-download is tolerated because the last
//! rename wins with identical bytes.

use std::path::PathBuf;

use anyhow::Context;
use renderfarm_protocol::AssetDto;
use reqwest::Url;

pub(crate) struct AssetCache {
    dir: PathBuf,
}

impl AssetCache {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Cache location for a manager blob path.
    pub(crate) fn local_path(&self, blob_url_path: &str) -> PathBuf {
        let rel: PathBuf = blob_url_path
            .split('/')
            .filter(|seg| !seg.is_empty() && *seg != "..")
            .collect();
        self.dir.join(rel)
    }

    /// Return the local copy of an asset, downloading it on first use.
    pub(crate) async fn ensure(
        &self,
        http: &reqwest::Client,
        manager_url: &Url,
        asset: &AssetDto,
    ) -> anyhow::Result<PathBuf> {
        let local = self.local_path(&asset.blend_file);
        if local.is_file() {
            tracing::debug!("asset found in local cache: {}", local.display());
            return Ok(local);
        }

        let url = manager_url
            .join(asset.blend_file.trim_start_matches('/'))
            .with_context(|| format!("bad asset URL path {:?}", asset.blend_file))?;
        tracing::info!("asset not cached, downloading {url}");
        crate::api::download_to(http, url, &local)
            .await
            .with_context(|| format!("downloading asset {:?}", asset.name))?;
        Ok(local)
    }
}
