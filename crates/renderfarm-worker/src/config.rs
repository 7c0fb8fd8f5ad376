//! Worker configuration.
//!
//! Three layers, later wins: compiled defaults, an optional TOML config
//! file, then environment variables / command-line flags (clap resolves the
//! last two together).

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Blender LTS series the worker provisions at boot.
pub const DEFAULT_LTS_SERIES: &str = "4.5";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub manager_url: Url,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub force_cpu_only: bool,
    pub force_gpu_only: bool,
    pub force_gpu_index: Option<usize>,
    pub gpu_split_mode: bool,
    /// Manual `--threads` override for the renderer; `None` means the worker
    /// computes a value (or omits the flag) per its hardware mode.
    pub cpu_threads: Option<u32>,
    pub working_dir: PathBuf,
    /// Where the renderer release catalog is fetched from. `None` relies on
    /// an already-populated on-disk cache.
    pub tool_catalog_url: Option<Url>,
    pub lts_series: String,
}

/// Subset of fields accepted from the TOML config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub manager_url: Option<String>,
    pub poll_interval_seconds: Option<u64>,
    pub heartbeat_interval_seconds: Option<u64>,
    pub force_cpu_only: Option<bool>,
    pub force_gpu_only: Option<bool>,
    pub force_gpu_index: Option<usize>,
    pub gpu_split_mode: Option<bool>,
    pub cpu_threads: Option<u32>,
    pub working_dir: Option<PathBuf>,
    pub tool_catalog_url: Option<String>,
    pub lts_series: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Overrides collected from flags/environment by the CLI layer. Every field
/// is optional; `None` falls through to the file value or the default.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub manager_url: Option<String>,
    pub poll_interval_seconds: Option<u64>,
    pub heartbeat_interval_seconds: Option<u64>,
    pub force_cpu_only: Option<bool>,
    pub force_gpu_only: Option<bool>,
    pub force_gpu_index: Option<usize>,
    pub gpu_split_mode: Option<bool>,
    pub cpu_threads: Option<u32>,
    pub working_dir: Option<PathBuf>,
    pub tool_catalog_url: Option<String>,
    pub lts_series: Option<String>,
}

fn parse_manager_url(raw: &str) -> anyhow::Result<Url> {
    // Endpoint paths are joined relative to the base, so it has to end with
    // a slash or the last segment is silently dropped.
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Ok(Url::parse(&normalized)?)
}

impl WorkerConfig {
    pub fn resolve(file: FileConfig, overrides: Overrides) -> anyhow::Result<Self> {
        let manager_url = overrides
            .manager_url
            .or(file.manager_url)
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());
        let poll_interval = overrides
            .poll_interval_seconds
            .or(file.poll_interval_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let heartbeat_interval = overrides
            .heartbeat_interval_seconds
            .or(file.heartbeat_interval_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);

        let config = WorkerConfig {
            manager_url: parse_manager_url(&manager_url)?,
            poll_interval,
            heartbeat_interval,
            force_cpu_only: overrides
                .force_cpu_only
                .or(file.force_cpu_only)
                .unwrap_or(false),
            force_gpu_only: overrides
                .force_gpu_only
                .or(file.force_gpu_only)
                .unwrap_or(false),
            force_gpu_index: overrides.force_gpu_index.or(file.force_gpu_index),
            gpu_split_mode: overrides
                .gpu_split_mode
                .or(file.gpu_split_mode)
                .unwrap_or(false),
            cpu_threads: overrides.cpu_threads.or(file.cpu_threads),
            working_dir: overrides
                .working_dir
                .or(file.working_dir)
                .unwrap_or_else(|| PathBuf::from("./worker_data")),
            tool_catalog_url: match overrides.tool_catalog_url.or(file.tool_catalog_url) {
                Some(raw) => Some(Url::parse(&raw)?),
                None => None,
            },
            lts_series: overrides
                .lts_series
                .or(file.lts_series)
                .unwrap_or_else(|| DEFAULT_LTS_SERIES.to_string()),
        };

        if config.force_cpu_only && config.force_gpu_only {
            anyhow::bail!("force_cpu_only and force_gpu_only are mutually exclusive");
        }
        Ok(config)
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.working_dir.join("managed_tools")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.working_dir.join("managed_assets")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.working_dir.join("render_output")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.working_dir.join("tmp")
    }

    pub fn catalog_cache_file(&self) -> PathBuf {
        self.tools_dir().join("blender_versions_cache.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = WorkerConfig::resolve(FileConfig::default(), Overrides::default()).unwrap();
        assert_eq!(cfg.manager_url.as_str(), "http://127.0.0.1:8000/");
        assert_eq!(cfg.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert!(!cfg.gpu_split_mode);
        assert_eq!(cfg.lts_series, DEFAULT_LTS_SERIES);
    }

    #[test]
    fn overrides_beat_file_values() {
        let file: FileConfig = toml::from_str(
            r#"
            manager_url = "http://farm.internal:9000"
            poll_interval_seconds = 11
            gpu_split_mode = true
            "#,
        )
        .unwrap();
        let overrides = Overrides {
            poll_interval_seconds: Some(2),
            ..Default::default()
        };

        let cfg = WorkerConfig::resolve(file, overrides).unwrap();
        // File provided the URL, override wins on the interval.
        assert_eq!(cfg.manager_url.as_str(), "http://farm.internal:9000/");
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert!(cfg.gpu_split_mode);
    }

    #[test]
    fn manager_url_gains_a_trailing_slash() {
        let overrides = Overrides {
            manager_url: Some("http://10.0.0.2:8000".to_string()),
            ..Default::default()
        };
        let cfg = WorkerConfig::resolve(FileConfig::default(), overrides).unwrap();
        assert_eq!(
            cfg.manager_url.join("api/jobs").unwrap().as_str(),
            "http://10.0.0.2:8000/api/jobs"
        );
    }

    #[test]
    fn conflicting_forced_modes_are_rejected() {
        let overrides = Overrides {
            force_cpu_only: Some(true),
            force_gpu_only: Some(true),
            ..Default::default()
        };
        assert!(WorkerConfig::resolve(FileConfig::default(), overrides).is_err());
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("managre_url = \"typo\"").is_err());
    }
}
