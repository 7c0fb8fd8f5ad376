use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    FeatureSet, FrameStatus, GpuBackend, JobStatus, RenderDevice, RenderEngine, Tiling,
    TiledJobStatus,
};

/// A project as returned by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDto {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub is_paused: bool,
}

/// An uploaded scene-file asset. `blend_file` is the manager-relative URL
/// path of the blob; workers resolve it against the manager base URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetDto {
    pub id: u64,
    pub project: Uuid,
    pub name: String,
    pub blend_file: String,
    pub created_at: DateTime<Utc>,
}

/// One physical GPU after backend-alias deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDeviceDto {
    pub index: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub backend: GpuBackend,
}

/// Structured capability report sent with a registration heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    #[serde(default)]
    pub blender_versions: Vec<String>,
    #[serde(default)]
    pub gpu_backends: Vec<GpuBackend>,
    #[serde(default)]
    pub gpu_devices: Vec<GpuDeviceDto>,
    #[serde(default)]
    pub cpu_threads: u32,
}

/// A worker record as returned by `GET /api/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDto {
    pub id: u64,
    pub hostname: String,
    pub ip_address: Option<String>,
    pub os: String,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub available_tools: WorkerCapabilities,
}

/// An atomic render job, with its asset embedded so a worker can fetch the
/// scene file without a second round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDto {
    pub id: u64,
    pub name: String,
    pub asset: AssetDto,
    pub output_file_pattern: String,
    pub start_frame: i32,
    pub end_frame: i32,
    pub status: JobStatus,
    pub assigned_worker: Option<u64>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub blender_version: String,
    pub render_engine: RenderEngine,
    pub render_device: RenderDevice,
    pub cycles_feature_set: FeatureSet,
    pub render_settings: BTreeMap<String, serde_json::Value>,
    pub render_time_seconds: Option<u64>,
    pub last_output: String,
    pub error_message: String,
    pub output_file: Option<String>,
    pub thumbnail: Option<String>,
    pub animation: Option<u64>,
    pub tiled_job: Option<Uuid>,
    pub animation_frame: Option<u64>,
}

/// A multi-frame animation parent, including the derived progress fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationDto {
    pub id: u64,
    pub project: Uuid,
    pub name: String,
    pub asset: u64,
    pub output_file_pattern: String,
    pub start_frame: i32,
    pub end_frame: i32,
    pub frame_step: i32,
    pub status: JobStatus,
    pub tiling_config: Tiling,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub blender_version: String,
    pub render_engine: RenderEngine,
    pub render_device: RenderDevice,
    pub cycles_feature_set: FeatureSet,
    pub render_settings: BTreeMap<String, serde_json::Value>,
    pub total_render_time_seconds: u64,
    pub thumbnail: Option<String>,
    pub total_frames: u32,
    pub completed_frames: u32,
}

/// One frame of a tiled animation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationFrameDto {
    pub id: u64,
    pub animation: u64,
    pub frame_number: i32,
    pub status: FrameStatus,
    pub output_file: Option<String>,
    pub render_time_seconds: u64,
    pub thumbnail: Option<String>,
}

/// A tiled single-image render parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiledJobDto {
    pub id: Uuid,
    pub project: Uuid,
    pub name: String,
    pub asset: u64,
    pub final_resolution_x: u32,
    pub final_resolution_y: u32,
    pub tile_count_x: u32,
    pub tile_count_y: u32,
    pub status: TiledJobStatus,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub blender_version: String,
    pub render_engine: RenderEngine,
    pub render_device: RenderDevice,
    pub cycles_feature_set: FeatureSet,
    pub render_settings: BTreeMap<String, serde_json::Value>,
    pub total_render_time_seconds: u64,
    pub output_file: Option<String>,
    pub thumbnail: Option<String>,
}

fn default_frame() -> i32 {
    1
}

fn default_step() -> i32 {
    1
}

fn default_blender_version() -> String {
    "4.5".to_string()
}

fn default_engine() -> RenderEngine {
    RenderEngine::Cycles
}

fn default_device() -> RenderDevice {
    RenderDevice::Any
}

fn default_feature_set() -> FeatureSet {
    FeatureSet::Supported
}

fn default_tiling() -> Tiling {
    Tiling::None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub asset_id: u64,
    pub output_file_pattern: String,
    #[serde(default = "default_frame")]
    pub start_frame: i32,
    #[serde(default = "default_frame")]
    pub end_frame: i32,
    #[serde(default = "default_blender_version")]
    pub blender_version: String,
    #[serde(default = "default_engine")]
    pub render_engine: RenderEngine,
    #[serde(default = "default_device")]
    pub render_device: RenderDevice,
    #[serde(default = "default_feature_set")]
    pub cycles_feature_set: FeatureSet,
    #[serde(default)]
    pub render_settings: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAnimationRequest {
    pub name: String,
    pub asset_id: u64,
    pub output_file_pattern: String,
    pub start_frame: i32,
    pub end_frame: i32,
    #[serde(default = "default_step")]
    pub frame_step: i32,
    #[serde(default = "default_tiling")]
    pub tiling_config: Tiling,
    #[serde(default = "default_blender_version")]
    pub blender_version: String,
    #[serde(default = "default_engine")]
    pub render_engine: RenderEngine,
    #[serde(default = "default_device")]
    pub render_device: RenderDevice,
    #[serde(default = "default_feature_set")]
    pub cycles_feature_set: FeatureSet,
    #[serde(default)]
    pub render_settings: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTiledJobRequest {
    pub name: String,
    pub asset_id: u64,
    pub final_resolution_x: u32,
    pub final_resolution_y: u32,
    pub tile_count_x: u32,
    pub tile_count_y: u32,
    #[serde(default = "default_blender_version")]
    pub blender_version: String,
    #[serde(default = "default_engine")]
    pub render_engine: RenderEngine,
    #[serde(default = "default_device")]
    pub render_device: RenderDevice,
    #[serde(default = "default_feature_set")]
    pub cycles_feature_set: FeatureSet,
    #[serde(default)]
    pub render_settings: BTreeMap<String, serde_json::Value>,
}

/// Partial update sent by workers: either a claim (`assigned_worker` alone)
/// or a progress/terminal report. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_time_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Heartbeat payload. With `available_tools` set this is an upsert keyed on
/// hostname (registration); with hostname alone it only refreshes
/// `last_seen` and 404s for unknown workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_tools: Option<WorkerCapabilities>,
}
