//! Hardware capability detection.
//!
//! GPU enumeration asks the renderer itself: a headless run with a small
//! script that prints the Cycles device list as JSON. One physical card
//! shows up once per backend (the same GPU under CUDA *and* OptiX), so the
//! raw list is grouped by the bus portion of the device id and collapsed to
//! one preferred backend per card.
//!
//! Results are process-scoped: detection is expensive (it boots the
//! renderer), so they are cached after the first call. Tests reset the cache
//! through [`reset_caches`].

use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use renderfarm_protocol::{GpuBackend, GpuDeviceDto};
use serde::Deserialize;

use crate::config::WorkerConfig;
use crate::tools::ToolStore;

const DETECT_TIMEOUT: Duration = Duration::from_secs(90);

/// Executed by the renderer in headless mode; prints a JSON device list on
/// the last stdout line the parser cares about.
const DETECT_GPUS_SCRIPT: &str = r#"import bpy
import json
import sys

try:
    bpy.context.scene.render.engine = 'CYCLES'
    prefs = bpy.context.preferences.addons['cycles'].preferences
    prefs.get_devices()
    devices = []
    for i, device in enumerate(prefs.devices):
        if device.type != 'CPU':
            devices.append({"index": i, "name": device.name, "type": device.type, "id": device.id})
    print(json.dumps(devices))
except Exception as exc:
    print(f"device enumeration failed: {exc}", file=sys.stderr)
    sys.exit(1)
"#;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawGpuDevice {
    #[allow(dead_code)]
    pub index: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub backend: String,
    pub id: String,
}

static GPU_CACHE: Mutex<Option<Vec<GpuDeviceDto>>> = Mutex::new(None);
static CPU_THREADS_CACHE: Mutex<Option<u32>> = Mutex::new(None);

/// Drop memoized detection results. Intended for tests and for forcing a
/// re-scan after a tool upgrade.
pub fn reset_caches() {
    *GPU_CACHE.lock().unwrap_or_else(|e| e.into_inner()) = None;
    *CPU_THREADS_CACHE.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

pub(crate) fn cpu_threads() -> u32 {
    let mut cache = CPU_THREADS_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(threads) = *cache {
        return threads;
    }
    let threads = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    *cache = Some(threads);
    threads
}

/// The canonical physical-GPU list for this host. `force_cpu_only` reports
/// an empty list without ever touching the renderer.
pub(crate) async fn detect_physical_gpus(
    config: &WorkerConfig,
    tools: &ToolStore,
) -> Vec<GpuDeviceDto> {
    if config.force_cpu_only {
        return Vec::new();
    }
    if let Some(cached) = GPU_CACHE.lock().unwrap_or_else(|e| e.into_inner()).clone() {
        return cached;
    }

    let devices = match enumerate_devices(config, tools).await {
        Ok(raw) => filter_preferred_gpus(raw),
        Err(err) => {
            tracing::warn!("GPU detection failed, reporting no GPUs: {err:#}");
            Vec::new()
        }
    };
    tracing::info!(
        "detected {} physical GPU(s): {:?}",
        devices.len(),
        devices.iter().map(|d| &d.name).collect::<Vec<_>>()
    );
    *GPU_CACHE.lock().unwrap_or_else(|e| e.into_inner()) = Some(devices.clone());
    devices
}

pub(crate) fn backends_of(devices: &[GpuDeviceDto]) -> Vec<GpuBackend> {
    let mut backends: Vec<GpuBackend> = devices.iter().map(|d| d.backend).collect();
    backends.sort();
    backends.dedup();
    backends
}

async fn enumerate_devices(
    config: &WorkerConfig,
    tools: &ToolStore,
) -> anyhow::Result<Vec<RawGpuDevice>> {
    let (version, exe) = tools
        .latest_installed()
        .ok_or_else(|| anyhow::anyhow!("no local renderer available for GPU detection"))?;
    tracing::debug!("enumerating GPU devices with renderer {version}");

    let script_path = config.temp_dir().join("detect_gpus.py");
    tokio::fs::create_dir_all(config.temp_dir()).await?;
    tokio::fs::write(&script_path, DETECT_GPUS_SCRIPT).await?;

    let output = tokio::time::timeout(
        DETECT_TIMEOUT,
        tokio::process::Command::new(&exe)
            .arg("--background")
            .arg("--factory-startup")
            .arg("--python")
            .arg(&script_path)
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("GPU detection timed out after {DETECT_TIMEOUT:?}"))??;

    let _ = tokio::fs::remove_file(&script_path).await;

    if !output.status.success() {
        anyhow::bail!(
            "GPU detection exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(parse_detection_output(&String::from_utf8_lossy(&output.stdout)))
}

/// The renderer chats on stdout (banner, quit notice); the device list is
/// whichever line parses as a JSON array.
pub(crate) fn parse_detection_output(stdout: &str) -> Vec<RawGpuDevice> {
    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with('[') {
            continue;
        }
        if let Ok(devices) = serde_json::from_str::<Vec<RawGpuDevice>>(line) {
            return devices;
        }
    }
    Vec::new()
}

fn parse_backend(raw: &str) -> Option<GpuBackend> {
    match raw {
        "OPTIX" => Some(GpuBackend::Optix),
        "CUDA" => Some(GpuBackend::Cuda),
        "HIP" => Some(GpuBackend::Hip),
        "METAL" => Some(GpuBackend::Metal),
        "ONEAPI" => Some(GpuBackend::OneApi),
        _ => None,
    }
}

fn bus_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)([0-9a-f]{4}:[0-9a-f]{2}:[0-9a-f]{2}(?:\.[0-9a-f])?)").unwrap()
    })
}

/// Grouping key for one physical card: the PCI/bus portion of the device id
/// when present, otherwise the id with backend decorations stripped.
pub(crate) fn bus_key(id: &str) -> String {
    if let Some(caps) = bus_regex().captures(id) {
        return caps[1].to_lowercase();
    }

    let mut key = id.to_string();
    for backend in ["OPTIX", "CUDA", "HIP", "METAL", "ONEAPI"] {
        let prefix = format!("{backend}_");
        if key.len() >= prefix.len() && key[..prefix.len()].eq_ignore_ascii_case(&prefix) {
            key = key[prefix.len()..].to_string();
        }
        let suffix = format!("_{backend}");
        if key.len() >= suffix.len()
            && key[key.len() - suffix.len()..].eq_ignore_ascii_case(&suffix)
        {
            key = key[..key.len() - suffix.len()].to_string();
        }
    }
    key.to_lowercase()
}

/// Collapse backend aliases to one entry per physical card.
///
/// Preference within a card: RTX hardware goes to OptiX, GTX hardware to
/// CUDA, anything else takes the first available backend in the global
/// preference order.
pub(crate) fn filter_preferred_gpus(raw: Vec<RawGpuDevice>) -> Vec<GpuDeviceDto> {
    let mut groups: Vec<(String, Vec<RawGpuDevice>)> = Vec::new();
    for device in raw {
        if parse_backend(&device.backend).is_none() {
            continue;
        }
        let key = bus_key(&device.id);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(device),
            None => groups.push((key, vec![device])),
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, members) in groups {
        let available: Vec<GpuBackend> = members
            .iter()
            .filter_map(|d| parse_backend(&d.backend))
            .collect();
        let name = &members[0].name;

        let chosen = if name.contains("RTX") && available.contains(&GpuBackend::Optix) {
            GpuBackend::Optix
        } else if name.contains("GTX") && available.contains(&GpuBackend::Cuda) {
            GpuBackend::Cuda
        } else {
            match GpuBackend::PREFERENCE
                .into_iter()
                .find(|b| available.contains(b))
            {
                Some(backend) => backend,
                None => continue,
            }
        };

        let member = members
            .iter()
            .find(|d| parse_backend(&d.backend) == Some(chosen))
            .unwrap_or(&members[0]);
        out.push(GpuDeviceDto {
            index: out.len(),
            name: member.name.clone(),
            backend: chosen,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(index: usize, name: &str, backend: &str, id: &str) -> RawGpuDevice {
        RawGpuDevice {
            index,
            name: name.to_string(),
            backend: backend.to_string(),
            id: id.to_string(),
        }
    }

    #[test]
    fn parses_json_line_out_of_renderer_chatter() {
        let stdout = "Blender 4.5.1\nsome warning\n[{\"index\": 0, \"name\": \"GPU\", \"type\": \"CUDA\", \"id\": \"CUDA_GPU_0000:01:00\"}]\nBlender quit\n";
        let devices = parse_detection_output(stdout);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].backend, "CUDA");
    }

    #[test]
    fn no_json_line_means_no_devices() {
        assert!(parse_detection_output("Blender 4.5.1\nBlender quit\n").is_empty());
    }

    #[test]
    fn groups_backend_aliases_by_bus_id() {
        // Two physical cards, each exposed under CUDA and OptiX.
        let devices = filter_preferred_gpus(vec![
            raw(0, "NVIDIA GeForce GTX 1070 Ti", "CUDA", "CUDA_NVIDIA GeForce GTX 1070 Ti_0000:0a:00"),
            raw(1, "NVIDIA GeForce RTX 3090", "CUDA", "CUDA_NVIDIA GeForce RTX 3090_0000:05:00"),
            raw(3, "NVIDIA GeForce GTX 1070 Ti", "OPTIX", "CUDA_NVIDIA GeForce GTX 1070 Ti_0000:0a:00_OptiX"),
            raw(4, "NVIDIA GeForce RTX 3090", "OPTIX", "CUDA_NVIDIA GeForce RTX 3090_0000:05:00_OptiX"),
        ]);

        assert_eq!(devices.len(), 2);
        let gtx = devices.iter().find(|d| d.name.contains("GTX")).unwrap();
        let rtx = devices.iter().find(|d| d.name.contains("RTX")).unwrap();
        assert_eq!(gtx.backend, GpuBackend::Cuda);
        assert_eq!(rtx.backend, GpuBackend::Optix);
    }

    #[test]
    fn preference_order_applies_without_marketing_names() {
        let devices = filter_preferred_gpus(vec![
            raw(0, "AMD Radeon PRO W7900", "HIP", "HIP_AMD Radeon PRO W7900_0000:03:00"),
        ]);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].backend, GpuBackend::Hip);
        assert_eq!(devices[0].index, 0);
    }

    #[test]
    fn unknown_backends_are_dropped() {
        let devices = filter_preferred_gpus(vec![raw(0, "Weird", "VULKAN", "VULKAN_Weird_1")]);
        assert!(devices.is_empty());
    }

    #[test]
    fn bus_key_survives_missing_pci_portion() {
        assert_eq!(bus_key("CUDA_Card A"), "card a");
        assert_eq!(bus_key("CUDA_Card A_OptiX"), "card a");
        assert_eq!(
            bus_key("CUDA_X_0000:0A:00"),
            bus_key("CUDA_X_0000:0a:00_OptiX")
        );
    }

    #[test]
    fn backends_are_distinct_and_sorted() {
        let devices = vec![
            GpuDeviceDto { index: 0, name: "a".into(), backend: GpuBackend::Cuda },
            GpuDeviceDto { index: 1, name: "b".into(), backend: GpuBackend::Optix },
            GpuDeviceDto { index: 2, name: "c".into(), backend: GpuBackend::Cuda },
        ];
        assert_eq!(backends_of(&devices), vec![GpuBackend::Optix, GpuBackend::Cuda]);
    }
}
