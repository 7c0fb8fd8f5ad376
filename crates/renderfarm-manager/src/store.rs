//! In-memory state and every mutation the HTTP layer is allowed to make.
//!
//! All maps live behind one mutex in [`crate::AppState`]; a store method runs
//! start-to-finish under that lock, which is what makes the conditional claim
//! and the status machines race-free across concurrent requests. Blob I/O
//! never happens in here.

use std::collections::BTreeMap;

use chrono::Utc;
use renderfarm_protocol::{
    AnimationDto, AnimationFrameDto, AssetDto, CreateAnimationRequest, CreateJobRequest,
    CreateTiledJobRequest, FrameStatus, HeartbeatRequest, JobDto, JobStatus, JobUpdateRequest,
    ProjectDto, RenderDevice, TiledJobDto, TiledJobStatus, WorkerDto,
};
use uuid::Uuid;

use crate::decompose;
use crate::error::ApiError;
use crate::models::{
    Animation, AnimationFrame, Asset, Job, Project, TiledJob, Worker, validate_name,
};
use crate::signals::{self, Cause, Effect};

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => ApiError::Validation(msg),
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
        }
    }
}

/// Filters accepted by `GET /api/jobs`. `unassigned_only` marks the
/// worker-poll shape: it adds the project pause gate and switches ordering to
/// FIFO by submission time.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct JobFilter {
    pub status: Option<JobStatus>,
    pub unassigned_only: bool,
    pub gpu_available: Option<bool>,
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    pub(crate) projects: BTreeMap<Uuid, Project>,
    pub(crate) assets: BTreeMap<u64, Asset>,
    pub(crate) workers: BTreeMap<u64, Worker>,
    pub(crate) jobs: BTreeMap<u64, Job>,
    pub(crate) animations: BTreeMap<u64, Animation>,
    pub(crate) frames: BTreeMap<u64, AnimationFrame>,
    pub(crate) tiled_jobs: BTreeMap<Uuid, TiledJob>,

    next_asset_id: u64,
    next_worker_id: u64,
    next_job_id: u64,
    next_animation_id: u64,
    next_frame_id: u64,
}

impl Store {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn alloc(counter: &mut u64) -> u64 {
        *counter += 1;
        *counter
    }

    pub(crate) fn next_job_id(&mut self) -> u64 {
        Self::alloc(&mut self.next_job_id)
    }

    pub(crate) fn next_frame_id(&mut self) -> u64 {
        Self::alloc(&mut self.next_frame_id)
    }

    // ----- projects -----

    pub(crate) fn create_project(&mut self, name: &str) -> Result<ProjectDto, StoreError> {
        let name = name.trim();
        validate_name(name).map_err(StoreError::Validation)?;
        if self.projects.values().any(|p| p.name == name) {
            return Err(StoreError::Validation(format!(
                "project name {name:?} is already taken"
            )));
        }

        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
            is_paused: false,
        };
        let dto = project.dto();
        self.projects.insert(project.id, project);
        Ok(dto)
    }

    pub(crate) fn list_projects(&self) -> Vec<ProjectDto> {
        let mut projects: Vec<&Project> = self.projects.values().collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        projects.into_iter().map(Project::dto).collect()
    }

    pub(crate) fn set_project_paused(
        &mut self,
        id: Uuid,
        paused: bool,
    ) -> Result<ProjectDto, StoreError> {
        let project = self
            .projects
            .get_mut(&id)
            .ok_or(StoreError::NotFound("project"))?;
        project.is_paused = paused;
        Ok(project.dto())
    }

    /// Cascade delete: the project owns its assets and parents, parents own
    /// their child jobs and frames. Worker references are untouched.
    pub(crate) fn delete_project(&mut self, id: Uuid) -> Result<(), StoreError> {
        if self.projects.remove(&id).is_none() {
            return Err(StoreError::NotFound("project"));
        }
        let asset_ids: Vec<u64> = self
            .assets
            .values()
            .filter(|a| a.project == id)
            .map(|a| a.id)
            .collect();
        self.assets.retain(|_, a| a.project != id);
        self.jobs.retain(|_, j| !asset_ids.contains(&j.asset));
        let animation_ids: Vec<u64> = self
            .animations
            .values()
            .filter(|a| a.project == id)
            .map(|a| a.id)
            .collect();
        self.animations.retain(|_, a| a.project != id);
        self.frames.retain(|_, f| !animation_ids.contains(&f.animation));
        self.tiled_jobs.retain(|_, t| t.project != id);
        Ok(())
    }

    // ----- assets -----

    pub(crate) fn create_asset(
        &mut self,
        project: Uuid,
        name: &str,
        blend_file_rel: String,
    ) -> Result<AssetDto, StoreError> {
        let name = name.trim();
        validate_name(name).map_err(StoreError::Validation)?;
        if !self.projects.contains_key(&project) {
            return Err(StoreError::Validation("unknown project".to_string()));
        }
        if self.assets.values().any(|a| a.name == name) {
            return Err(StoreError::Validation(format!(
                "asset name {name:?} is already taken"
            )));
        }

        let asset = Asset {
            id: Self::alloc(&mut self.next_asset_id),
            project,
            name: name.to_string(),
            blend_file: blend_file_rel,
            created_at: Utc::now(),
        };
        let dto = asset.dto();
        self.assets.insert(asset.id, asset);
        Ok(dto)
    }

    pub(crate) fn get_asset(&self, id: u64) -> Result<AssetDto, StoreError> {
        self.assets
            .get(&id)
            .map(Asset::dto)
            .ok_or(StoreError::NotFound("asset"))
    }

    pub(crate) fn asset_blob_rel(&self, id: u64) -> Result<String, StoreError> {
        self.assets
            .get(&id)
            .map(|a| a.blend_file.clone())
            .ok_or(StoreError::NotFound("asset"))
    }

    /// Assets are immutable inputs; deletion is refused while anything still
    /// renders from them.
    pub(crate) fn delete_asset(&mut self, id: u64) -> Result<(), StoreError> {
        if !self.assets.contains_key(&id) {
            return Err(StoreError::NotFound("asset"));
        }
        let referenced = self.jobs.values().any(|j| j.asset == id)
            || self.animations.values().any(|a| a.asset == id)
            || self.tiled_jobs.values().any(|t| t.asset == id);
        if referenced {
            return Err(StoreError::Conflict(
                "asset is referenced by existing work and cannot be deleted".to_string(),
            ));
        }
        self.assets.remove(&id);
        Ok(())
    }

    // ----- workers -----

    pub(crate) fn heartbeat(&mut self, req: HeartbeatRequest) -> Result<WorkerDto, StoreError> {
        let now = Utc::now();
        let existing_id = self
            .workers
            .values()
            .find(|w| w.hostname == req.hostname)
            .map(|w| w.id);

        match (existing_id, req.available_tools) {
            (Some(id), Some(capabilities)) => {
                let worker = self.workers.get_mut(&id).ok_or(StoreError::NotFound("worker"))?;
                worker.capabilities = capabilities;
                if req.ip_address.is_some() {
                    worker.ip_address = req.ip_address;
                }
                if let Some(os) = req.os {
                    worker.os = os;
                }
                worker.last_seen = now;
                worker.is_active = true;
                Ok(worker.dto())
            }
            (Some(id), None) => {
                let worker = self.workers.get_mut(&id).ok_or(StoreError::NotFound("worker"))?;
                worker.last_seen = now;
                Ok(worker.dto())
            }
            (None, Some(capabilities)) => {
                let worker = Worker {
                    id: Self::alloc(&mut self.next_worker_id),
                    hostname: req.hostname,
                    ip_address: req.ip_address,
                    os: req.os.unwrap_or_default(),
                    last_seen: now,
                    is_active: true,
                    capabilities,
                };
                let dto = worker.dto();
                self.workers.insert(worker.id, worker);
                Ok(dto)
            }
            // A bare heartbeat from an unknown hostname means the worker must
            // re-register with a full capability payload.
            (None, None) => Err(StoreError::NotFound("worker")),
        }
    }

    pub(crate) fn list_workers(&self) -> Vec<WorkerDto> {
        let mut workers: Vec<&Worker> = self.workers.values().collect();
        workers.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        workers.into_iter().map(Worker::dto).collect()
    }

    // ----- jobs -----

    pub(crate) fn job_name_taken(&self, name: &str) -> bool {
        self.jobs.values().any(|j| j.name == name)
    }

    pub(crate) fn create_job(&mut self, req: CreateJobRequest) -> Result<JobDto, StoreError> {
        let name = req.name.trim().to_string();
        validate_name(&name).map_err(StoreError::Validation)?;
        if self.job_name_taken(&name) {
            return Err(StoreError::Validation(format!(
                "job name {name:?} is already taken"
            )));
        }
        if !self.assets.contains_key(&req.asset_id) {
            return Err(StoreError::Validation("unknown asset".to_string()));
        }
        if req.end_frame < req.start_frame {
            return Err(StoreError::Validation(
                "end_frame must be >= start_frame".to_string(),
            ));
        }

        let job = Job {
            id: self.next_job_id(),
            name,
            asset: req.asset_id,
            output_file_pattern: req.output_file_pattern,
            start_frame: req.start_frame,
            end_frame: req.end_frame,
            status: JobStatus::Queued,
            assigned_worker: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            blender_version: req.blender_version,
            render_engine: req.render_engine,
            render_device: req.render_device,
            cycles_feature_set: req.cycles_feature_set,
            render_settings: req.render_settings,
            render_time_seconds: None,
            last_output: String::new(),
            error_message: String::new(),
            output_file: None,
            thumbnail: None,
            animation: None,
            tiled_job: None,
            animation_frame: None,
        };
        let dto = self.job_dto(&job)?;
        self.jobs.insert(job.id, job);
        Ok(dto)
    }

    pub(crate) fn job_dto(&self, job: &Job) -> Result<JobDto, StoreError> {
        let asset = self.assets.get(&job.asset).ok_or(StoreError::NotFound("asset"))?;
        Ok(job.dto(asset))
    }

    pub(crate) fn get_job(&self, id: u64) -> Result<JobDto, StoreError> {
        let job = self.jobs.get(&id).ok_or(StoreError::NotFound("job"))?;
        self.job_dto(job)
    }

    fn job_project_paused(&self, job: &Job) -> bool {
        self.assets
            .get(&job.asset)
            .and_then(|a| self.projects.get(&a.project))
            .map(|p| p.is_paused)
            .unwrap_or(false)
    }

    pub(crate) fn list_jobs(&self, filter: JobFilter) -> Vec<JobDto> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| !filter.unassigned_only || j.assigned_worker.is_none())
            .filter(|j| !filter.unassigned_only || !self.job_project_paused(j))
            .filter(|j| match filter.gpu_available {
                // CPU-only pollers never see GPU work; GPU pollers never see
                // CPU-only work.
                Some(false) => j.render_device != RenderDevice::Gpu,
                Some(true) => j.render_device != RenderDevice::Cpu,
                None => true,
            })
            .collect();

        if filter.unassigned_only {
            jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        } else {
            jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(b.id.cmp(&a.id)));
        }
        jobs.into_iter()
            .filter_map(|j| self.job_dto(j).ok())
            .collect()
    }

    /// The claim: succeeds only against an unassigned QUEUED job; everything
    /// else is a conflict for the caller to skip past.
    pub(crate) fn claim_job(&mut self, id: u64, worker: u64) -> Result<(), StoreError> {
        if !self.workers.contains_key(&worker) {
            return Err(StoreError::Validation("unknown worker".to_string()));
        }
        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound("job"))?;
        if job.assigned_worker.is_some() || job.status != JobStatus::Queued {
            return Err(StoreError::Conflict(format!(
                "job {id} is not available for claiming"
            )));
        }
        job.assigned_worker = Some(worker);
        Ok(())
    }

    fn check_transition(current: JobStatus, next: JobStatus) -> Result<(), StoreError> {
        use JobStatus::*;
        // Repeated reports of the current state are tolerated as no-ops.
        if current == next {
            return Ok(());
        }
        let allowed = matches!(
            (current, next),
            (Queued, Rendering)
                | (Queued, Canceled)
                | (Rendering, Done)
                | (Rendering, Error)
                | (Rendering, Canceled)
        );
        if allowed {
            Ok(())
        } else {
            Err(StoreError::Validation(format!(
                "illegal status transition {current} -> {next}"
            )))
        }
    }

    /// Apply a PATCH body. A claim (`assigned_worker`) is resolved first;
    /// the remaining fields are a progress/terminal report.
    pub(crate) fn update_job(
        &mut self,
        id: u64,
        update: JobUpdateRequest,
        cause: Cause,
    ) -> Result<(JobDto, Vec<Effect>), StoreError> {
        if let Some(worker) = update.assigned_worker {
            self.claim_job(id, worker)?;
        }

        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound("job"))?;
        let mut status_changed = false;

        if let Some(next) = update.status {
            Self::check_transition(job.status, next)?;
            if job.status != next {
                status_changed = true;
                job.status = next;
                if next == JobStatus::Rendering && job.started_at.is_none() {
                    job.started_at = Some(update.started_at.unwrap_or_else(Utc::now));
                }
                if next.is_terminal() && job.completed_at.is_none() {
                    job.completed_at = Some(update.completed_at.unwrap_or_else(Utc::now));
                }
            }
        }
        if let Some(secs) = update.render_time_seconds {
            job.render_time_seconds = Some(secs);
        }
        if let Some(output) = update.last_output {
            job.last_output = output;
        }
        if let Some(message) = update.error_message {
            job.error_message = message;
        }

        let snapshot = self.jobs.get(&id).cloned().ok_or(StoreError::NotFound("job"))?;
        let dto = self.job_dto(&snapshot)?;
        let effects = if status_changed && cause == Cause::External {
            signals::on_job_saved(self, id)
        } else {
            Vec::new()
        };
        Ok((dto, effects))
    }

    pub(crate) fn cancel_job(&mut self, id: u64) -> Result<(JobDto, Vec<Effect>), StoreError> {
        {
            let job = self.jobs.get(&id).ok_or(StoreError::NotFound("job"))?;
            if job.status.is_terminal() {
                return Err(StoreError::Validation(format!(
                    "job {id} is already {}",
                    job.status
                )));
            }
        }
        self.update_job(
            id,
            JobUpdateRequest {
                status: Some(JobStatus::Canceled),
                error_message: Some("Job was canceled by user request.".to_string()),
                ..Default::default()
            },
            Cause::External,
        )
    }

    /// Record an uploaded artifact and let the aggregator react.
    pub(crate) fn attach_job_output(
        &mut self,
        id: u64,
        rel: String,
    ) -> Result<(JobDto, Vec<Effect>), StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound("job"))?;
        job.output_file = Some(rel);
        let snapshot = self.jobs.get(&id).cloned().ok_or(StoreError::NotFound("job"))?;
        let dto = self.job_dto(&snapshot)?;
        let effects = signals::on_job_saved(self, id);
        Ok((dto, effects))
    }

    /// Directory under `outputs/` a job's artifacts land in: animation
    /// children share the animation directory, everything else gets its own.
    pub(crate) fn job_output_dir(&self, id: u64) -> Result<(Uuid, String), StoreError> {
        let job = self.jobs.get(&id).ok_or(StoreError::NotFound("job"))?;
        let asset = self.assets.get(&job.asset).ok_or(StoreError::NotFound("asset"))?;
        let dir = match (job.animation, job.tiled_job) {
            (Some(animation), _) => format!("animation_{animation}"),
            (None, Some(tiled)) => format!("tiled-job_{}", crate::media::short_id(tiled)),
            (None, None) => format!("job_{id}"),
        };
        Ok((asset.project, dir))
    }

    // ----- animations -----

    pub(crate) fn create_animation(
        &mut self,
        req: CreateAnimationRequest,
    ) -> Result<AnimationDto, StoreError> {
        let name = req.name.trim().to_string();
        validate_name(&name).map_err(StoreError::Validation)?;
        if self.animations.values().any(|a| a.name == name) {
            return Err(StoreError::Validation(format!(
                "animation name {name:?} is already taken"
            )));
        }
        let asset = self
            .assets
            .get(&req.asset_id)
            .ok_or_else(|| StoreError::Validation("unknown asset".to_string()))?;
        if req.end_frame < req.start_frame {
            return Err(StoreError::Validation(
                "end_frame must be >= start_frame".to_string(),
            ));
        }
        if req.frame_step < 1 {
            return Err(StoreError::Validation("frame_step must be >= 1".to_string()));
        }

        let animation = Animation {
            id: Self::alloc(&mut self.next_animation_id),
            project: asset.project,
            name,
            asset: req.asset_id,
            output_file_pattern: req.output_file_pattern,
            start_frame: req.start_frame,
            end_frame: req.end_frame,
            frame_step: req.frame_step,
            status: JobStatus::Queued,
            tiling_config: req.tiling_config,
            submitted_at: Utc::now(),
            completed_at: None,
            blender_version: req.blender_version,
            render_engine: req.render_engine,
            render_device: req.render_device,
            cycles_feature_set: req.cycles_feature_set,
            render_settings: req.render_settings,
            total_render_time_seconds: 0,
            thumbnail: None,
        };
        let id = animation.id;
        self.animations.insert(id, animation.clone());

        // Child units are materialized in the same store transaction so they
        // are pollable the moment the create call returns.
        if let Err(err) = decompose::expand_animation(self, &animation) {
            self.animations.remove(&id);
            self.jobs.retain(|_, j| j.animation != Some(id));
            self.frames.retain(|_, f| f.animation != id);
            return Err(err);
        }
        self.animation_dto(id)
    }

    pub(crate) fn animation_dto(&self, id: u64) -> Result<AnimationDto, StoreError> {
        let animation = self
            .animations
            .get(&id)
            .ok_or(StoreError::NotFound("animation"))?;
        let completed = if animation.tiling_config.grid().is_some() {
            self.frames
                .values()
                .filter(|f| f.animation == id && f.status == FrameStatus::Done)
                .count() as u32
        } else {
            self.jobs
                .values()
                .filter(|j| j.animation == Some(id) && j.status == JobStatus::Done)
                .count() as u32
        };
        Ok(animation.dto(completed))
    }

    pub(crate) fn list_animation_frames(&self, id: u64) -> Result<Vec<AnimationFrameDto>, StoreError> {
        if !self.animations.contains_key(&id) {
            return Err(StoreError::NotFound("animation"));
        }
        let mut frames: Vec<&AnimationFrame> = self
            .frames
            .values()
            .filter(|f| f.animation == id)
            .collect();
        frames.sort_by_key(|f| f.frame_number);
        Ok(frames.into_iter().map(AnimationFrame::dto).collect())
    }

    /// Cancel the whole animation: QUEUED children flip immediately,
    /// RENDERING children stay assigned until their worker notices the
    /// CANCELED status on its cancel poll and kills the subprocess.
    pub(crate) fn cancel_animation(&mut self, id: u64) -> Result<AnimationDto, StoreError> {
        let animation = self
            .animations
            .get_mut(&id)
            .ok_or(StoreError::NotFound("animation"))?;
        if animation.status.is_terminal() {
            return Err(StoreError::Validation(format!(
                "animation {id} is already {}",
                animation.status
            )));
        }
        animation.status = JobStatus::Canceled;
        animation.completed_at = Some(Utc::now());

        let child_ids: Vec<u64> = self
            .jobs
            .values()
            .filter(|j| j.animation == Some(id) && !j.status.is_terminal())
            .map(|j| j.id)
            .collect();
        for child in child_ids {
            // Cascade writes carry the aggregator cause so they do not
            // re-enter the roll-up that initiated them.
            self.update_job(
                child,
                JobUpdateRequest {
                    status: Some(JobStatus::Canceled),
                    error_message: Some("Job was canceled by user request.".to_string()),
                    ..Default::default()
                },
                Cause::Aggregator,
            )?;
        }
        self.animation_dto(id)
    }

    // ----- tiled jobs -----

    pub(crate) fn create_tiled_job(
        &mut self,
        req: CreateTiledJobRequest,
    ) -> Result<TiledJobDto, StoreError> {
        let name = req.name.trim().to_string();
        validate_name(&name).map_err(StoreError::Validation)?;
        if self.tiled_jobs.values().any(|t| t.name == name) {
            return Err(StoreError::Validation(format!(
                "tiled job name {name:?} is already taken"
            )));
        }
        let asset = self
            .assets
            .get(&req.asset_id)
            .ok_or_else(|| StoreError::Validation("unknown asset".to_string()))?;
        if req.tile_count_x == 0 || req.tile_count_y == 0 {
            return Err(StoreError::Validation("tile counts must be >= 1".to_string()));
        }
        if req.final_resolution_x == 0 || req.final_resolution_y == 0 {
            return Err(StoreError::Validation(
                "final resolution must be non-zero".to_string(),
            ));
        }

        let tiled = TiledJob {
            id: Uuid::new_v4(),
            project: asset.project,
            name,
            asset: req.asset_id,
            final_resolution_x: req.final_resolution_x,
            final_resolution_y: req.final_resolution_y,
            tile_count_x: req.tile_count_x,
            tile_count_y: req.tile_count_y,
            status: TiledJobStatus::Queued,
            submitted_at: Utc::now(),
            completed_at: None,
            blender_version: req.blender_version,
            render_engine: req.render_engine,
            render_device: req.render_device,
            cycles_feature_set: req.cycles_feature_set,
            render_settings: req.render_settings,
            total_render_time_seconds: 0,
            output_file: None,
            thumbnail: None,
        };
        let id = tiled.id;
        self.tiled_jobs.insert(id, tiled.clone());

        if let Err(err) = decompose::expand_tiled_job(self, &tiled) {
            self.tiled_jobs.remove(&id);
            self.jobs.retain(|_, j| j.tiled_job != Some(id));
            return Err(err);
        }
        self.get_tiled_job(id)
    }

    pub(crate) fn get_tiled_job(&self, id: Uuid) -> Result<TiledJobDto, StoreError> {
        self.tiled_jobs
            .get(&id)
            .map(TiledJob::dto)
            .ok_or(StoreError::NotFound("tiled job"))
    }
}
