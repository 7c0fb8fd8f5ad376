//! Renderer provisioning: local version scanning, partial-version
//! resolution, catalog-driven download with SHA-256 verification, and
//! archive unpacking.
//!
//! Installed versions live in fully-qualified directories
//! (`blender-<X.Y.Z>-<platform>`) under `<tools>/blender/`, so concurrent
//! provisioning of different versions cannot collide. The release catalog is
//! a JSON document mapping `version -> platform -> {url, sha256}`; it is
//! fetched once and cached next to the installs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::WorkerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveKind {
    Zip,
    TarGz,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Platform {
    pub id: &'static str,
    pub exe_rel: &'static [&'static str],
    pub archive: ArchiveKind,
}

pub(crate) fn current_platform() -> Option<Platform> {
    let platform = match (std::env::consts::OS, std::env::consts::ARCH) {
        ("windows", "x86_64") => Platform {
            id: "windows-x64",
            exe_rel: &["blender.exe"],
            archive: ArchiveKind::Zip,
        },
        ("windows", "aarch64") => Platform {
            id: "windows-arm64",
            exe_rel: &["blender.exe"],
            archive: ArchiveKind::Zip,
        },
        ("linux", "x86_64") => Platform {
            id: "linux-x64",
            exe_rel: &["blender"],
            archive: ArchiveKind::TarGz,
        },
        ("linux", "aarch64") => Platform {
            id: "linux-arm64",
            exe_rel: &["blender"],
            archive: ArchiveKind::TarGz,
        },
        ("macos", "x86_64") => Platform {
            id: "macos-x64",
            exe_rel: &["Blender.app", "Contents", "MacOS", "Blender"],
            archive: ArchiveKind::TarGz,
        },
        ("macos", "aarch64") => Platform {
            id: "macos-arm64",
            exe_rel: &["Blender.app", "Contents", "MacOS", "Blender"],
            archive: ArchiveKind::TarGz,
        },
        _ => return None,
    };
    Some(platform)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReleaseInfo {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// `version -> platform id -> release`.
pub(crate) type Catalog = BTreeMap<String, BTreeMap<String, ReleaseInfo>>;

pub(crate) fn parse_version(v: &str) -> Option<(u32, u32, u32)> {
    let mut parts = v.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

pub(crate) fn is_series(v: &str) -> bool {
    let mut parts = v.split('.');
    let ok = parts.next().is_some_and(|p| p.parse::<u32>().is_ok())
        && parts.next().is_some_and(|p| p.parse::<u32>().is_ok());
    ok && parts.next().is_none()
}

/// Highest full version within `series` (e.g. "4.5" -> "4.5.12").
pub(crate) fn latest_patch<'a>(
    versions: impl IntoIterator<Item = &'a str>,
    series: &str,
) -> Option<String> {
    versions
        .into_iter()
        .filter(|v| v.starts_with(&format!("{series}.")))
        .filter_map(|v| parse_version(v).map(|parsed| (parsed, v)))
        .max_by_key(|(parsed, _)| *parsed)
        .map(|(_, v)| v.to_string())
}

pub(crate) struct ToolStore {
    http: reqwest::Client,
    blender_dir: PathBuf,
    catalog_cache_file: PathBuf,
    catalog_url: Option<reqwest::Url>,
    platform: Platform,
}

impl ToolStore {
    pub(crate) fn new(config: &WorkerConfig, http: reqwest::Client) -> anyhow::Result<Self> {
        let platform = current_platform()
            .ok_or_else(|| anyhow::anyhow!(
                "unsupported platform {}-{} for renderer management",
                std::env::consts::OS,
                std::env::consts::ARCH
            ))?;
        Ok(Self {
            http,
            blender_dir: config.tools_dir().join("blender"),
            catalog_cache_file: config.catalog_cache_file(),
            catalog_url: config.tool_catalog_url.clone(),
            platform,
        })
    }

    fn install_dir_name(&self, version: &str) -> String {
        format!("blender-{version}-{}", self.platform.id)
    }

    fn executable_for_install(&self, install_dir_name: &str) -> PathBuf {
        let mut path = self.blender_dir.join(install_dir_name);
        for part in self.platform.exe_rel {
            path = path.join(part);
        }
        path
    }

    /// Path of an installed version's executable, if present.
    pub(crate) fn executable_path(&self, version: &str) -> Option<PathBuf> {
        let path = self.executable_for_install(&self.install_dir_name(version));
        path.is_file().then_some(path)
    }

    /// Versions installed under the managed directory (executable verified).
    pub(crate) fn scan_local(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.blender_dir) else {
            return Vec::new();
        };
        let mut versions = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix("blender-") else {
                continue;
            };
            let Some(version) = rest.strip_suffix(&format!("-{}", self.platform.id)) else {
                continue;
            };
            if parse_version(version).is_some() && self.executable_path(version).is_some() {
                versions.push(version.to_string());
            }
        }
        versions.sort_by_key(|v| parse_version(v));
        versions
    }

    pub(crate) fn latest_installed(&self) -> Option<(String, PathBuf)> {
        let version = self.scan_local().into_iter().next_back()?;
        let exe = self.executable_path(&version)?;
        Some((version, exe))
    }

    async fn catalog(&self) -> anyhow::Result<Catalog> {
        if self.catalog_cache_file.is_file() {
            let raw = tokio::fs::read_to_string(&self.catalog_cache_file).await?;
            match serde_json::from_str(&raw) {
                Ok(catalog) => return Ok(catalog),
                Err(err) => {
                    tracing::warn!("release catalog cache is corrupt ({err}), refetching");
                }
            }
        }

        let url = self
            .catalog_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no release catalog URL configured and no cached catalog"))?;
        let res = self.http.get(url.clone()).send().await?;
        if !res.status().is_success() {
            anyhow::bail!("fetching release catalog from {url}: http {}", res.status());
        }
        let catalog: Catalog = res.json().await?;

        if let Some(parent) = self.catalog_cache_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&catalog)?;
        let tmp = self.catalog_cache_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.catalog_cache_file).await?;
        tracing::info!(
            "cached release catalog at {}",
            self.catalog_cache_file.display()
        );
        Ok(catalog)
    }

    /// Resolve `X.Y` to the newest local patch, falling back to the newest
    /// published patch. Full `X.Y.Z` strings pass through.
    pub(crate) async fn resolve_version(&self, requested: &str) -> anyhow::Result<String> {
        if parse_version(requested).is_some() {
            return Ok(requested.to_string());
        }
        if !is_series(requested) {
            anyhow::bail!("invalid renderer version {requested:?}; expected X.Y or X.Y.Z");
        }

        let local = self.scan_local();
        if let Some(version) = latest_patch(local.iter().map(String::as_str), requested) {
            tracing::debug!("resolved {requested:?} to local version {version}");
            return Ok(version);
        }

        let catalog = self.catalog().await?;
        latest_patch(catalog.keys().map(String::as_str), requested)
            .ok_or_else(|| anyhow::anyhow!("no published patch for series {requested:?}"))
    }

    /// Make the requested version runnable, downloading it if needed.
    pub(crate) async fn ensure_available(&self, requested: &str) -> anyhow::Result<PathBuf> {
        let version = self.resolve_version(requested).await?;

        if let Some(exe) = self.executable_path(&version) {
            return Ok(exe);
        }

        tracing::info!("renderer {version} not installed, downloading");
        let catalog = self.catalog().await?;
        let info = catalog
            .get(&version)
            .and_then(|platforms| platforms.get(self.platform.id))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no release of {version} for platform {}",
                    self.platform.id
                )
            })?
            .clone();
        self.install(&version, &info).await
    }

    /// Bootstrap path: newest patch of the configured LTS series. Prefers the
    /// published catalog; falls back to whatever is already installed when
    /// the catalog is unreachable.
    pub(crate) async fn ensure_latest_lts(&self, series: &str) -> anyhow::Result<PathBuf> {
        match self.catalog().await {
            Ok(catalog) => {
                let version = latest_patch(catalog.keys().map(String::as_str), series)
                    .ok_or_else(|| anyhow::anyhow!("no published patch for LTS series {series:?}"))?;
                self.ensure_available(&version).await
            }
            Err(err) => {
                let local = self.scan_local();
                match latest_patch(local.iter().map(String::as_str), series) {
                    Some(version) => {
                        tracing::warn!(
                            "release catalog unavailable ({err:#}); using installed {version}"
                        );
                        self.executable_path(&version)
                            .ok_or_else(|| anyhow::anyhow!("installed {version} lost its executable"))
                    }
                    None => Err(err.context(format!(
                        "no installed patch of series {series:?} to fall back to"
                    ))),
                }
            }
        }
    }

    async fn install(&self, version: &str, info: &ReleaseInfo) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.blender_dir).await?;

        let url = reqwest::Url::parse(&info.url)
            .with_context(|| format!("bad release URL {:?}", info.url))?;
        let archive_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.archive", self.install_dir_name(version)));
        let archive_path = self.blender_dir.join(archive_name);

        tracing::info!("downloading {} to {}", info.url, archive_path.display());
        crate::api::download_to(&self.http, url, &archive_path).await?;

        if let Err(err) = verify_archive(&archive_path, info.sha256.as_deref()) {
            // Never leave an unverified archive around to poison a retry.
            let _ = std::fs::remove_file(&archive_path);
            return Err(err);
        }

        let dest = self.blender_dir.clone();
        let kind = self.platform.archive;
        let archive_for_unpack = archive_path.clone();
        tokio::task::spawn_blocking(move || unpack(&archive_for_unpack, &dest, kind))
            .await
            .map_err(|err| anyhow::anyhow!("unpack task join error: {err:#}"))??;
        let _ = std::fs::remove_file(&archive_path);

        let exe = self.executable_path(version).ok_or_else(|| {
            anyhow::anyhow!(
                "archive for {version} did not produce {}",
                self.executable_for_install(&self.install_dir_name(version)).display()
            )
        })?;
        set_executable(&exe)?;
        tracing::info!("renderer {version} installed at {}", exe.display());
        Ok(exe)
    }
}

/// SHA-256 gate on downloaded archives. A missing hash is treated the same
/// as a mismatch: the file cannot be trusted.
pub(crate) fn verify_archive(path: &Path, expected: Option<&str>) -> anyhow::Result<()> {
    let Some(expected) = expected else {
        anyhow::bail!(
            "no SHA-256 published for {}; refusing unverified archive",
            path.display()
        );
    };
    let actual = file_sha256(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        anyhow::bail!(
            "hash mismatch for {}: expected {expected}, got {actual}",
            path.display()
        );
    }
    Ok(())
}

pub(crate) fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn unpack(archive: &Path, dest: &Path, kind: ArchiveKind) -> anyhow::Result<()> {
    match kind {
        ArchiveKind::Zip => {
            let file = std::fs::File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file)
                .with_context(|| format!("reading {}", archive.display()))?;
            zip.extract(dest)
                .with_context(|| format!("extracting {}", archive.display()))?;
        }
        ArchiveKind::TarGz => {
            let file = std::fs::File::open(archive)?;
            let gz = flate2::read::GzDecoder::new(file);
            tar::Archive::new(gz)
                .unpack(dest)
                .with_context(|| format!("extracting {}", archive.display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
