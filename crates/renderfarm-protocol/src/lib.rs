#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared wire types for the renderfarm manager and worker agent.
//!
//! Everything that crosses the HTTP boundary lives here: entity DTOs, request
//! payloads, status enums, and the render-settings key constants understood by
//! the worker's preamble generator.

mod dto;
mod types;

pub mod settings;

pub use dto::{
    AnimationDto, AnimationFrameDto, AssetDto, CreateAnimationRequest, CreateJobRequest,
    CreateProjectRequest, CreateTiledJobRequest, GpuDeviceDto, HeartbeatRequest, JobDto,
    JobUpdateRequest, ProjectDto, TiledJobDto, WorkerCapabilities, WorkerDto,
};
pub use types::{FeatureSet, FrameStatus, GpuBackend, JobStatus, RenderDevice, RenderEngine, Tiling, TiledJobStatus};
