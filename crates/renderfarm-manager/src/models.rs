//! In-memory entity records and their wire conversions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use renderfarm_protocol::{
    AnimationDto, AnimationFrameDto, AssetDto, FeatureSet, FrameStatus, JobDto, JobStatus,
    ProjectDto, RenderDevice, RenderEngine, Tiling, TiledJobDto, TiledJobStatus, WorkerCapabilities,
    WorkerDto,
};
use uuid::Uuid;

use crate::media::MediaStore;

/// Project/asset/job names are human-entered; keep them short and non-empty.
pub(crate) fn validate_name(name: &str) -> Result<(), String> {
    let len = name.chars().count();
    if !(4..=40).contains(&len) {
        return Err(format!("name must be 4-40 characters, got {len}"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub(crate) struct Project {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub is_paused: bool,
}

impl Project {
    pub(crate) fn dto(&self) -> ProjectDto {
        ProjectDto {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            is_paused: self.is_paused,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Asset {
    pub id: u64,
    pub project: Uuid,
    pub name: String,
    /// Media-root-relative path of the stored blob.
    pub blend_file: String,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    pub(crate) fn dto(&self) -> AssetDto {
        AssetDto {
            id: self.id,
            project: self.project,
            name: self.name.clone(),
            blend_file: MediaStore::url(&self.blend_file),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Worker {
    pub id: u64,
    pub hostname: String,
    pub ip_address: Option<String>,
    pub os: String,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub capabilities: WorkerCapabilities,
}

impl Worker {
    pub(crate) fn dto(&self) -> WorkerDto {
        WorkerDto {
            id: self.id,
            hostname: self.hostname.clone(),
            ip_address: self.ip_address.clone(),
            os: self.os.clone(),
            last_seen: self.last_seen,
            is_active: self.is_active,
            available_tools: self.capabilities.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: u64,
    pub name: String,
    pub asset: u64,
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

impl Job {
    pub(crate) fn dto(&self, asset: &Asset) -> JobDto {
        JobDto {
            id: self.id,
            name: self.name.clone(),
            asset: asset.dto(),
            output_file_pattern: self.output_file_pattern.clone(),
            start_frame: self.start_frame,
            end_frame: self.end_frame,
            status: self.status,
            assigned_worker: self.assigned_worker,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            blender_version: self.blender_version.clone(),
            render_engine: self.render_engine,
            render_device: self.render_device,
            cycles_feature_set: self.cycles_feature_set,
            render_settings: self.render_settings.clone(),
            render_time_seconds: self.render_time_seconds,
            last_output: self.last_output.clone(),
            error_message: self.error_message.clone(),
            output_file: self.output_file.as_deref().map(MediaStore::url),
            thumbnail: self.thumbnail.as_deref().map(MediaStore::url),
            animation: self.animation,
            tiled_job: self.tiled_job,
            animation_frame: self.animation_frame,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Animation {
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
}

impl Animation {
    /// Frame numbers this animation renders, honoring the step.
    pub(crate) fn frame_numbers(&self) -> Vec<i32> {
        let mut frames = Vec::new();
        let mut f = self.start_frame;
        while f <= self.end_frame {
            frames.push(f);
            f += self.frame_step;
        }
        frames
    }

    pub(crate) fn expected_frames(&self) -> u32 {
        self.frame_numbers().len() as u32
    }

    pub(crate) fn dto(&self, completed_frames: u32) -> AnimationDto {
        AnimationDto {
            id: self.id,
            project: self.project,
            name: self.name.clone(),
            asset: self.asset,
            output_file_pattern: self.output_file_pattern.clone(),
            start_frame: self.start_frame,
            end_frame: self.end_frame,
            frame_step: self.frame_step,
            status: self.status,
            tiling_config: self.tiling_config,
            submitted_at: self.submitted_at,
            completed_at: self.completed_at,
            blender_version: self.blender_version.clone(),
            render_engine: self.render_engine,
            render_device: self.render_device,
            cycles_feature_set: self.cycles_feature_set,
            render_settings: self.render_settings.clone(),
            total_render_time_seconds: self.total_render_time_seconds,
            thumbnail: self.thumbnail.as_deref().map(MediaStore::url),
            total_frames: self.expected_frames(),
            completed_frames,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AnimationFrame {
    pub id: u64,
    pub animation: u64,
    pub frame_number: i32,
    pub status: FrameStatus,
    pub output_file: Option<String>,
    pub render_time_seconds: u64,
    pub thumbnail: Option<String>,
}

impl AnimationFrame {
    pub(crate) fn dto(&self) -> AnimationFrameDto {
        AnimationFrameDto {
            id: self.id,
            animation: self.animation,
            frame_number: self.frame_number,
            status: self.status,
            output_file: self.output_file.as_deref().map(MediaStore::url),
            render_time_seconds: self.render_time_seconds,
            thumbnail: self.thumbnail.as_deref().map(MediaStore::url),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TiledJob {
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

impl TiledJob {
    pub(crate) fn dto(&self) -> TiledJobDto {
        TiledJobDto {
            id: self.id,
            project: self.project,
            name: self.name.clone(),
            asset: self.asset,
            final_resolution_x: self.final_resolution_x,
            final_resolution_y: self.final_resolution_y,
            tile_count_x: self.tile_count_x,
            tile_count_y: self.tile_count_y,
            status: self.status,
            submitted_at: self.submitted_at,
            completed_at: self.completed_at,
            blender_version: self.blender_version.clone(),
            render_engine: self.render_engine,
            render_device: self.render_device,
            cycles_feature_set: self.cycles_feature_set,
            render_settings: self.render_settings.clone(),
            total_render_time_seconds: self.total_render_time_seconds,
            output_file: self.output_file.as_deref().map(MediaStore::url),
            thumbnail: self.thumbnail.as_deref().map(MediaStore::url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn animation_with_range(start: i32, end: i32, step: i32) -> Animation {
        Animation {
            id: 1,
            project: Uuid::new_v4(),
            name: "walk cycle".into(),
            asset: 1,
            output_file_pattern: "walk_####".into(),
            start_frame: start,
            end_frame: end,
            frame_step: step,
            status: JobStatus::Queued,
            tiling_config: Tiling::None,
            submitted_at: Utc::now(),
            completed_at: None,
            blender_version: "4.5".into(),
            render_engine: RenderEngine::Cycles,
            render_device: RenderDevice::Any,
            cycles_feature_set: FeatureSet::Supported,
            render_settings: BTreeMap::new(),
            total_render_time_seconds: 0,
            thumbnail: None,
        }
    }

    #[test]
    fn frame_numbers_honor_step() {
        assert_eq!(animation_with_range(1, 5, 2).frame_numbers(), vec![1, 3, 5]);
        assert_eq!(animation_with_range(1, 3, 1).frame_numbers(), vec![1, 2, 3]);
        assert_eq!(animation_with_range(10, 10, 1).frame_numbers(), vec![10]);
        assert_eq!(animation_with_range(1, 6, 3).expected_frames(), 2);
    }

    #[test]
    fn name_validation_bounds() {
        assert!(validate_name("abc").is_err());
        assert!(validate_name("abcd").is_ok());
        assert!(validate_name(&"x".repeat(40)).is_ok());
        assert!(validate_name(&"x".repeat(41)).is_err());
    }
}
