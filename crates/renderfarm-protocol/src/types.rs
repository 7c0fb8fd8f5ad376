use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of an atomic render job (and of a non-tiled animation parent,
/// which reuses the same states).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Rendering,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    /// Whether no further transitions are allowed out of this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Rendering => "RENDERING",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
            JobStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RENDERING" => Ok(JobStatus::Rendering),
            "DONE" => Ok(JobStatus::Done),
            "ERROR" => Ok(JobStatus::Error),
            "CANCELED" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

/// Lifecycle of a tiled single-image render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TiledJobStatus {
    Queued,
    Rendering,
    Assembling,
    Done,
    Error,
}

/// Lifecycle of a single frame of a tiled animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameStatus {
    Pending,
    Rendering,
    Assembling,
    Done,
    Error,
}

/// Render engine passed through to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderEngine {
    #[serde(rename = "CYCLES")]
    Cycles,
    #[serde(rename = "BLENDER_EEVEE_NEXT")]
    EeveeNext,
    #[serde(rename = "BLENDER_WORKBENCH")]
    Workbench,
}

impl RenderEngine {
    /// The identifier the renderer's scripting API expects.
    pub fn as_str(self) -> &'static str {
        match self {
            RenderEngine::Cycles => "CYCLES",
            RenderEngine::EeveeNext => "BLENDER_EEVEE_NEXT",
            RenderEngine::Workbench => "BLENDER_WORKBENCH",
        }
    }
}

impl fmt::Display for RenderEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device class a job may be scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderDevice {
    Cpu,
    Gpu,
    Any,
}

impl fmt::Display for RenderDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RenderDevice::Cpu => "CPU",
            RenderDevice::Gpu => "GPU",
            RenderDevice::Any => "ANY",
        };
        f.write_str(s)
    }
}

/// Cycles feature set toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureSet {
    Supported,
    Experimental,
}

/// GPU compute backend as reported by the renderer's device enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GpuBackend {
    #[serde(rename = "OPTIX")]
    Optix,
    #[serde(rename = "CUDA")]
    Cuda,
    #[serde(rename = "HIP")]
    Hip,
    #[serde(rename = "METAL")]
    Metal,
    #[serde(rename = "ONEAPI")]
    OneApi,
}

impl GpuBackend {
    /// Backend selection order used both when deduplicating physical devices
    /// and when picking the compute backend for a GPU render.
    pub const PREFERENCE: [GpuBackend; 5] = [
        GpuBackend::Optix,
        GpuBackend::Cuda,
        GpuBackend::Hip,
        GpuBackend::Metal,
        GpuBackend::OneApi,
    ];

    /// The identifier the renderer's preferences API expects.
    pub fn as_str(self) -> &'static str {
        match self {
            GpuBackend::Optix => "OPTIX",
            GpuBackend::Cuda => "CUDA",
            GpuBackend::Hip => "HIP",
            GpuBackend::Metal => "METAL",
            GpuBackend::OneApi => "ONEAPI",
        }
    }
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tiling grid applied to each frame of an animation (or `None` for whole
/// frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tiling {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "2x2")]
    TwoByTwo,
    #[serde(rename = "3x3")]
    ThreeByThree,
    #[serde(rename = "4x4")]
    FourByFour,
}

impl Tiling {
    /// Grid dimensions `(tiles_x, tiles_y)`, or `None` when frames render
    /// whole.
    pub fn grid(self) -> Option<(u32, u32)> {
        match self {
            Tiling::None => None,
            Tiling::TwoByTwo => Some((2, 2)),
            Tiling::ThreeByThree => Some((3, 3)),
            Tiling::FourByFour => Some((4, 4)),
        }
    }

    /// Number of tile jobs each frame decomposes into.
    pub fn tile_count(self) -> u32 {
        self.grid().map(|(x, y)| x * y).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_wire_names_are_screaming_case() {
        let s = serde_json::to_string(&JobStatus::Queued).unwrap();
        assert_eq!(s, "\"QUEUED\"");
        let parsed: JobStatus = serde_json::from_str("\"CANCELED\"").unwrap();
        assert_eq!(parsed, JobStatus::Canceled);
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Rendering.is_terminal());
    }

    #[test]
    fn tiling_wire_names_and_grids() {
        let t: Tiling = serde_json::from_str("\"2x2\"").unwrap();
        assert_eq!(t, Tiling::TwoByTwo);
        assert_eq!(t.grid(), Some((2, 2)));
        assert_eq!(Tiling::FourByFour.tile_count(), 16);
        assert_eq!(Tiling::None.grid(), None);
    }

    #[test]
    fn oneapi_backend_round_trips_without_underscore() {
        let s = serde_json::to_string(&GpuBackend::OneApi).unwrap();
        assert_eq!(s, "\"ONEAPI\"");
    }
}
