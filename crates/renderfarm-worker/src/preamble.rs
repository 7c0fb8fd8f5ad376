//! Generation of the render configuration preamble.
//!
//! The preamble is a short script the renderer executes before rendering:
//! it selects the engine, configures the compute device, and applies the
//! job's settings map as scene attribute writes. It is data-driven text
//! assembly; nothing here runs Python.

use std::collections::BTreeMap;

use renderfarm_protocol::{GpuBackend, RenderDevice, RenderEngine};
use serde_json::Value;

pub(crate) struct PreambleSpec<'a> {
    pub engine: RenderEngine,
    pub device: RenderDevice,
    pub settings: &'a BTreeMap<String, Value>,
    /// Backends detected on this host, already deduplicated per card.
    pub detected_backends: &'a [GpuBackend],
    /// Restrict rendering to one physical GPU (split mode or a global
    /// forced index).
    pub target_gpu_index: Option<usize>,
    /// Split-mode CPU fallback: an `ANY` job executing on the CPU slot.
    pub force_cpu: bool,
}

fn py_value(value: &Value) -> String {
    match value {
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => "None".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        other => other.to_string(),
    }
}

pub(crate) fn generate(spec: &PreambleSpec<'_>) -> String {
    let mut lines = vec!["import bpy".to_string()];

    // Engine first so the device configuration below has the right context.
    lines.push(format!(
        "bpy.context.scene.render.engine = '{}'",
        spec.engine.as_str()
    ));

    if spec.engine == RenderEngine::Cycles {
        let use_gpu = !spec.force_cpu
            && (spec.device == RenderDevice::Gpu
                || (spec.device == RenderDevice::Any && !spec.detected_backends.is_empty()));

        let chosen = use_gpu
            .then(|| {
                GpuBackend::PREFERENCE
                    .into_iter()
                    .find(|b| spec.detected_backends.contains(b))
            })
            .flatten();

        match chosen {
            Some(backend) => {
                lines.push("prefs = bpy.context.preferences.addons['cycles'].preferences".to_string());
                lines.push(format!("prefs.compute_device_type = '{backend}'"));
                lines.push(format!("print('Using compute backend: {backend}')"));
                lines.push("prefs.get_devices()".to_string());

                match spec.target_gpu_index {
                    Some(index) => {
                        lines.push(format!("target_gpu_index = {index}"));
                        lines.push(
                            "non_cpu_devices = [d for d in prefs.devices if d.type != 'CPU']"
                                .to_string(),
                        );
                        // Clean slate, then enable exactly the targeted card.
                        lines.push("for device in prefs.devices: device.use = False".to_string());
                        lines.push("if 0 <= target_gpu_index < len(non_cpu_devices):".to_string());
                        lines.push("    target_device = non_cpu_devices[target_gpu_index]".to_string());
                        lines.push("    print(f'Isolating GPU: {target_device.name}')".to_string());
                        lines.push("    target_device.use = True".to_string());
                        lines.push("else:".to_string());
                        lines.push("    print(f'WARNING: GPU index {target_gpu_index} is out of range; enabling all GPUs')".to_string());
                        lines.push("    for device in non_cpu_devices: device.use = True".to_string());
                    }
                    None => {
                        lines.push("for device in prefs.devices:".to_string());
                        lines.push("    if device.type != 'CPU': device.use = True".to_string());
                    }
                }
                lines.push("bpy.context.scene.cycles.device = 'GPU'".to_string());
            }
            None => {
                lines.push("bpy.context.scene.cycles.device = 'CPU'".to_string());
            }
        }
    }

    if !spec.settings.is_empty() {
        lines.push("for scene in bpy.data.scenes:".to_string());
        for (path, value) in spec.settings {
            lines.push(format!("    scene.{path} = {}", py_value(value)));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn cpu_job_sets_cpu_device_and_no_prefs() {
        let s = settings(&[]);
        let script = generate(&PreambleSpec {
            engine: RenderEngine::Cycles,
            device: RenderDevice::Cpu,
            settings: &s,
            detected_backends: &[GpuBackend::Optix],
            target_gpu_index: None,
            force_cpu: false,
        });
        assert!(script.contains("bpy.context.scene.cycles.device = 'CPU'"));
        assert!(!script.contains("compute_device_type"));
    }

    #[test]
    fn gpu_job_picks_preferred_backend() {
        let s = settings(&[]);
        let script = generate(&PreambleSpec {
            engine: RenderEngine::Cycles,
            device: RenderDevice::Gpu,
            settings: &s,
            detected_backends: &[GpuBackend::Hip, GpuBackend::Cuda],
            target_gpu_index: None,
            force_cpu: false,
        });
        assert!(script.contains("prefs.compute_device_type = 'CUDA'"));
        assert!(script.contains("bpy.context.scene.cycles.device = 'GPU'"));
        assert!(script.contains("if device.type != 'CPU': device.use = True"));
    }

    #[test]
    fn assigned_index_disables_everything_then_isolates_one_card() {
        let s = settings(&[]);
        let script = generate(&PreambleSpec {
            engine: RenderEngine::Cycles,
            device: RenderDevice::Gpu,
            settings: &s,
            detected_backends: &[GpuBackend::Optix],
            target_gpu_index: Some(1),
            force_cpu: false,
        });
        assert!(script.contains("target_gpu_index = 1"));
        let disable = script
            .find("for device in prefs.devices: device.use = False")
            .unwrap();
        let enable = script.find("target_device.use = True").unwrap();
        assert!(disable < enable, "devices must be cleared before isolating");
        assert!(script.contains("Isolating GPU"));
    }

    #[test]
    fn any_job_without_gpus_configures_cpu() {
        let s = settings(&[]);
        let script = generate(&PreambleSpec {
            engine: RenderEngine::Cycles,
            device: RenderDevice::Any,
            settings: &s,
            detected_backends: &[],
            target_gpu_index: None,
            force_cpu: false,
        });
        assert!(script.contains("bpy.context.scene.cycles.device = 'CPU'"));
    }

    #[test]
    fn split_mode_fallback_forces_cpu_despite_gpus() {
        let s = settings(&[]);
        let script = generate(&PreambleSpec {
            engine: RenderEngine::Cycles,
            device: RenderDevice::Any,
            settings: &s,
            detected_backends: &[GpuBackend::Optix],
            target_gpu_index: None,
            force_cpu: true,
        });
        assert!(script.contains("bpy.context.scene.cycles.device = 'CPU'"));
        assert!(!script.contains("compute_device_type"));
    }

    #[test]
    fn non_cycles_engine_skips_device_configuration() {
        let s = settings(&[]);
        let script = generate(&PreambleSpec {
            engine: RenderEngine::EeveeNext,
            device: RenderDevice::Gpu,
            settings: &s,
            detected_backends: &[GpuBackend::Optix],
            target_gpu_index: None,
            force_cpu: false,
        });
        assert!(script.contains("bpy.context.scene.render.engine = 'BLENDER_EEVEE_NEXT'"));
        assert!(!script.contains("cycles.device"));
    }

    #[test]
    fn settings_map_becomes_scene_attribute_writes() {
        let s = settings(&[
            ("cycles.samples", json!(64)),
            ("render.use_border", json!(true)),
            ("render.border_min_x", json!(0.5)),
            ("render.filepath", json!("it's a path")),
        ]);
        let script = generate(&PreambleSpec {
            engine: RenderEngine::Cycles,
            device: RenderDevice::Cpu,
            settings: &s,
            detected_backends: &[],
            target_gpu_index: None,
            force_cpu: false,
        });
        assert!(script.contains("for scene in bpy.data.scenes:"));
        assert!(script.contains("    scene.cycles.samples = 64"));
        assert!(script.contains("    scene.render.use_border = True"));
        assert!(script.contains("    scene.render.border_min_x = 0.5"));
        assert!(script.contains("    scene.render.filepath = 'it\\'s a path'"));
    }
}
