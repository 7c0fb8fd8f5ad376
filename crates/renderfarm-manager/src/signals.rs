//! Aggregation: parent roll-ups and the follow-on image work.
//!
//! Repository mutations fire `on_job_saved` / `on_frame_saved` after the
//! write, mirroring a persistence-event hook. Handlers run pure roll-ups
//! (status, render-time totals) directly against the store and return
//! [`Effect`]s for work that touches the filesystem — assembly and
//! thumbnails — which [`run_effects`] performs off the store lock.
//!
//! The [`Cause`] token controls re-entrancy: writes performed while applying
//! an effect (thumbnail attachment, assembly bookkeeping) are made with
//! `Cause::Aggregator` or through dedicated methods that do not fire the
//! hooks again, so a cascade cannot loop back into itself.

use chrono::Utc;
use renderfarm_protocol::{FrameStatus, JobStatus, TiledJobStatus, settings};
use uuid::Uuid;

use crate::AppState;
use crate::assembler::{self, StitchSpec, TileInput};
use crate::media::{MediaStore, short_id};
use crate::store::Store;
use crate::thumbs;

/// Who is performing a write: an external request, or the aggregator itself
/// reacting to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cause {
    External,
    Aggregator,
}

/// Deferred filesystem work produced by a roll-up.
#[derive(Debug, Clone)]
pub(crate) enum Effect {
    AssembleFrame(u64),
    AssembleTiledJob(Uuid),
    /// Thumbnail a standalone job's fresh output (and refresh the parent
    /// animation's preview when the job belongs to one).
    JobThumbnail(u64),
    /// Refresh the animation's preview from an assembled frame.
    AnimationThumbnail { animation: u64, source_rel: String },
}

pub(crate) fn on_job_saved(store: &mut Store, job_id: u64) -> Vec<Effect> {
    let Some(job) = store.jobs.get(&job_id).cloned() else {
        return Vec::new();
    };
    let mut effects = Vec::new();

    if let Some(frame_id) = job.animation_frame {
        roll_up_tiled_frame(store, frame_id, &job, &mut effects);
    } else if let Some(animation_id) = job.animation {
        roll_up_plain_animation(store, animation_id);
    } else if let Some(tiled_id) = job.tiled_job {
        roll_up_tiled_job(store, tiled_id, &mut effects);
    }

    // Standalone outputs get a preview; tile outputs are intermediate and
    // are thumbnailed only after assembly.
    if job.output_file.is_some()
        && job.thumbnail.is_none()
        && job.animation_frame.is_none()
        && job.tiled_job.is_none()
    {
        effects.push(Effect::JobThumbnail(job_id));
    }

    effects
}

fn roll_up_tiled_frame(
    store: &mut Store,
    frame_id: u64,
    job: &crate::models::Job,
    effects: &mut Vec<Effect>,
) {
    let Some(frame) = store.frames.get(&frame_id) else {
        return;
    };
    let Some(animation) = store.animations.get(&frame.animation) else {
        return;
    };
    let expected = animation.tiling_config.tile_count();

    match job.status {
        JobStatus::Rendering if frame.status == FrameStatus::Pending => {
            if let Some(frame) = store.frames.get_mut(&frame_id) {
                frame.status = FrameStatus::Rendering;
            }
        }
        JobStatus::Done => {
            // A tile counts once its terminal report *and* its upload are in,
            // whichever order they arrive.
            let done = store
                .jobs
                .values()
                .filter(|j| {
                    j.animation_frame == Some(frame_id)
                        && j.status == JobStatus::Done
                        && j.output_file.is_some()
                })
                .count() as u32;
            let frame_ready = matches!(
                store.frames.get(&frame_id).map(|f| f.status),
                Some(FrameStatus::Pending | FrameStatus::Rendering)
            );
            if done >= expected && frame_ready {
                tracing::info!(
                    frame = frame_id,
                    tiles = expected,
                    "all tiles complete, triggering frame assembly"
                );
                if let Some(frame) = store.frames.get_mut(&frame_id) {
                    frame.status = FrameStatus::Assembling;
                }
                effects.push(Effect::AssembleFrame(frame_id));
            }
        }
        _ => {}
    }
}

fn roll_up_plain_animation(store: &mut Store, animation_id: u64) {
    let Some(animation) = store.animations.get(&animation_id) else {
        return;
    };
    if animation.status.is_terminal() {
        return;
    }

    let children: Vec<&crate::models::Job> = store
        .jobs
        .values()
        .filter(|j| j.animation == Some(animation_id))
        .collect();
    if children.is_empty() {
        return;
    }

    let total_time: u64 = children
        .iter()
        .filter(|j| j.status == JobStatus::Done)
        .filter_map(|j| j.render_time_seconds)
        .sum();
    let finished = children.iter().filter(|j| j.status.is_terminal()).count();
    let all_finished = finished == children.len();

    let Some(animation) = store.animations.get_mut(&animation_id) else {
        return;
    };
    animation.total_render_time_seconds = total_time;
    if animation.status == JobStatus::Queued && finished > 0 {
        animation.status = JobStatus::Rendering;
    }
    if all_finished {
        animation.status = JobStatus::Done;
        if animation.completed_at.is_none() {
            animation.completed_at = Some(Utc::now());
        }
    }
}

fn roll_up_tiled_job(store: &mut Store, tiled_id: Uuid, effects: &mut Vec<Effect>) {
    let Some(tiled) = store.tiled_jobs.get(&tiled_id) else {
        return;
    };
    if matches!(tiled.status, TiledJobStatus::Done | TiledJobStatus::Error) {
        return;
    }
    let expected = tiled.tile_count_x * tiled.tile_count_y;

    let tiles: Vec<&crate::models::Job> = store
        .jobs
        .values()
        .filter(|j| j.tiled_job == Some(tiled_id))
        .collect();
    let total_time: u64 = tiles
        .iter()
        .filter(|j| j.status == JobStatus::Done)
        .filter_map(|j| j.render_time_seconds)
        .sum();
    let done = tiles
        .iter()
        .filter(|j| j.status == JobStatus::Done && j.output_file.is_some())
        .count() as u32;

    let Some(tiled) = store.tiled_jobs.get_mut(&tiled_id) else {
        return;
    };
    tiled.total_render_time_seconds = total_time;
    if tiled.status == TiledJobStatus::Queued {
        tiled.status = TiledJobStatus::Rendering;
    }
    if done >= expected && tiled.status == TiledJobStatus::Rendering {
        tracing::info!(tiled_job = %tiled_id, tiles = expected, "all tiles complete, triggering assembly");
        tiled.status = TiledJobStatus::Assembling;
        effects.push(Effect::AssembleTiledJob(tiled_id));
    }
}

pub(crate) fn on_frame_saved(store: &mut Store, frame_id: u64) -> Vec<Effect> {
    let Some(frame) = store.frames.get(&frame_id).cloned() else {
        return Vec::new();
    };
    let mut effects = Vec::new();

    // Every assembled frame refreshes the parent's preview so the animation
    // thumbnail tracks rendering progress.
    if let Some(rel) = &frame.output_file {
        effects.push(Effect::AnimationThumbnail {
            animation: frame.animation,
            source_rel: rel.clone(),
        });
    }

    let Some(animation) = store.animations.get(&frame.animation) else {
        return effects;
    };
    if animation.status.is_terminal() {
        return effects;
    }

    if frame.status == FrameStatus::Done && animation.status == JobStatus::Queued {
        if let Some(animation) = store.animations.get_mut(&frame.animation) {
            animation.status = JobStatus::Rendering;
        }
    }

    let Some(animation) = store.animations.get(&frame.animation) else {
        return effects;
    };
    let expected = animation.expected_frames();
    let done_frames: Vec<&crate::models::AnimationFrame> = store
        .frames
        .values()
        .filter(|f| f.animation == frame.animation && f.status == FrameStatus::Done)
        .collect();

    if expected > 0 && done_frames.len() as u32 == expected {
        let total_time: u64 = done_frames.iter().map(|f| f.render_time_seconds).sum();
        let animation_id = frame.animation;
        if let Some(animation) = store.animations.get_mut(&animation_id) {
            tracing::info!(animation = animation_id, frames = expected, "animation complete");
            animation.status = JobStatus::Done;
            animation.total_render_time_seconds = total_time;
            if animation.completed_at.is_none() {
                animation.completed_at = Some(Utc::now());
            }
        }
    }

    effects
}

// ----- effect execution -----

struct FrameAssemblyJob {
    project: Uuid,
    animation: u64,
    frame_number: i32,
    spec: StitchSpec,
    tile_outputs: Vec<(u64, String)>,
    total_render_time: u64,
}

fn frame_assembly_job(
    store: &Store,
    media: &MediaStore,
    frame_id: u64,
) -> Result<FrameAssemblyJob, String> {
    let frame = store
        .frames
        .get(&frame_id)
        .ok_or_else(|| format!("frame {frame_id} not found"))?;
    let animation = store
        .animations
        .get(&frame.animation)
        .ok_or_else(|| format!("animation {} not found", frame.animation))?;
    let (tiles_x, tiles_y) = animation
        .tiling_config
        .grid()
        .ok_or_else(|| "frame belongs to a non-tiled animation".to_string())?;

    let mut tile_jobs: Vec<&crate::models::Job> = store
        .jobs
        .values()
        .filter(|j| j.animation_frame == Some(frame_id) && j.status == JobStatus::Done)
        .collect();
    tile_jobs.sort_by(|a, b| a.name.cmp(&b.name));

    let first = tile_jobs
        .first()
        .ok_or_else(|| "no completed tiles to assemble".to_string())?;
    let width = read_resolution(&first.render_settings, settings::RESOLUTION_X)?;
    let height = read_resolution(&first.render_settings, settings::RESOLUTION_Y)?;

    let mut tiles = Vec::with_capacity(tile_jobs.len());
    let mut tile_outputs = Vec::with_capacity(tile_jobs.len());
    let mut total_render_time = 0u64;
    for job in &tile_jobs {
        let rel = job
            .output_file
            .as_ref()
            .ok_or_else(|| format!("tile job {} has no uploaded output", job.name))?;
        tiles.push(TileInput {
            job_name: job.name.clone(),
            path: media.abs(rel),
        });
        tile_outputs.push((job.id, rel.clone()));
        total_render_time += job.render_time_seconds.unwrap_or(0);
    }

    Ok(FrameAssemblyJob {
        project: animation.project,
        animation: animation.id,
        frame_number: frame.frame_number,
        spec: StitchSpec {
            tiles,
            tiles_x,
            tiles_y,
            width,
            height,
        },
        tile_outputs,
        total_render_time,
    })
}

fn read_resolution(
    settings_map: &std::collections::BTreeMap<String, serde_json::Value>,
    key: &str,
) -> Result<u32, String> {
    settings_map
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("tile render settings are missing {key}"))
}

/// Drain the effect queue, locking the store only for bookkeeping and doing
/// the image work on the blocking pool.
pub(crate) async fn run_effects(state: &AppState, mut effects: Vec<Effect>) {
    while let Some(effect) = effects.pop() {
        let follow_ups = match effect {
            Effect::AssembleFrame(frame_id) => assemble_frame(state, frame_id).await,
            Effect::AssembleTiledJob(tiled_id) => assemble_tiled_job(state, tiled_id).await,
            Effect::JobThumbnail(job_id) => job_thumbnail(state, job_id).await,
            Effect::AnimationThumbnail { animation, source_rel } => {
                animation_thumbnail(state, animation, &source_rel).await
            }
        };
        effects.extend(follow_ups);
    }
}

async fn stitch_png(spec: StitchSpec) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    tokio::task::spawn_blocking(move || {
        let image = assembler::stitch(&spec)?;
        let png = assembler::encode_png(&image)?;
        let thumb = thumbs::thumbnail_png_from_image(&image.into())?;
        Ok((png, thumb))
    })
    .await
    .map_err(|err| anyhow::anyhow!("assembly task join error: {err:#}"))?
}

async fn assemble_frame(state: &AppState, frame_id: u64) -> Vec<Effect> {
    let job = {
        let store = state.store();
        frame_assembly_job(&store, state.media(), frame_id)
    };
    let job = match job {
        Ok(job) => job,
        Err(reason) => return fail_frame(state, frame_id, &reason),
    };

    let stitched = stitch_png(job.spec).await;
    let (png, thumb) = match stitched {
        Ok(v) => v,
        Err(err) => return fail_frame(state, frame_id, &format!("{err:#}")),
    };

    let output_rel = MediaStore::job_output_rel(
        job.project,
        &format!("animation_{}", job.animation),
        &format!("anim_{}_frame_{:04}.png", job.animation, job.frame_number),
    );
    let thumb_rel = MediaStore::thumbnail_rel(job.project, "animationframe", &frame_id.to_string());
    let media = state.media();
    if let Err(err) = media.write(&output_rel, &png) {
        return fail_frame(state, frame_id, &format!("writing assembled frame: {err}"));
    }
    let _ = media.remove(&thumb_rel);
    if let Err(err) = media.write(&thumb_rel, &thumb) {
        return fail_frame(state, frame_id, &format!("writing frame thumbnail: {err}"));
    }

    // Tile outputs are intermediates; reclaim the space now that the frame
    // exists.
    for (_, rel) in &job.tile_outputs {
        if let Err(err) = media.remove(rel) {
            tracing::warn!("could not remove tile output {rel}: {err}");
        }
    }

    let mut store = state.store();
    for (job_id, _) in &job.tile_outputs {
        if let Some(tile) = store.jobs.get_mut(job_id) {
            tile.output_file = None;
        }
    }
    if let Some(frame) = store.frames.get_mut(&frame_id) {
        frame.output_file = Some(output_rel);
        frame.thumbnail = Some(thumb_rel);
        frame.render_time_seconds = job.total_render_time;
        frame.status = FrameStatus::Done;
    }
    on_frame_saved(&mut store, frame_id)
}

fn fail_frame(state: &AppState, frame_id: u64, reason: &str) -> Vec<Effect> {
    tracing::error!(frame = frame_id, "frame assembly failed: {reason}");
    let mut store = state.store();
    if let Some(frame) = store.frames.get_mut(&frame_id) {
        frame.status = FrameStatus::Error;
    }
    Vec::new()
}

struct TiledAssemblyJob {
    project: Uuid,
    spec: StitchSpec,
}

fn tiled_assembly_job(
    store: &Store,
    media: &MediaStore,
    tiled_id: Uuid,
) -> Result<TiledAssemblyJob, String> {
    let tiled = store
        .tiled_jobs
        .get(&tiled_id)
        .ok_or_else(|| format!("tiled job {tiled_id} not found"))?;

    let mut tile_jobs: Vec<&crate::models::Job> = store
        .jobs
        .values()
        .filter(|j| j.tiled_job == Some(tiled_id) && j.status == JobStatus::Done)
        .collect();
    tile_jobs.sort_by(|a, b| a.name.cmp(&b.name));

    let mut tiles = Vec::with_capacity(tile_jobs.len());
    for job in &tile_jobs {
        let rel = job
            .output_file
            .as_ref()
            .ok_or_else(|| format!("tile job {} has no uploaded output", job.name))?;
        tiles.push(TileInput {
            job_name: job.name.clone(),
            path: media.abs(rel),
        });
    }

    Ok(TiledAssemblyJob {
        project: tiled.project,
        spec: StitchSpec {
            tiles,
            tiles_x: tiled.tile_count_x,
            tiles_y: tiled.tile_count_y,
            width: tiled.final_resolution_x,
            height: tiled.final_resolution_y,
        },
    })
}

async fn assemble_tiled_job(state: &AppState, tiled_id: Uuid) -> Vec<Effect> {
    let job = {
        let store = state.store();
        tiled_assembly_job(&store, state.media(), tiled_id)
    };
    let job = match job {
        Ok(job) => job,
        Err(reason) => return fail_tiled(state, tiled_id, &reason),
    };

    let stitched = stitch_png(job.spec).await;
    let (png, thumb) = match stitched {
        Ok(v) => v,
        Err(err) => return fail_tiled(state, tiled_id, &format!("{err:#}")),
    };

    let output_rel = MediaStore::job_output_rel(
        job.project,
        &format!("tiled-job_{}", short_id(tiled_id)),
        &format!("tiled_job_{tiled_id}_final.png"),
    );
    let thumb_rel = MediaStore::thumbnail_rel(job.project, "tiledjob", &short_id(tiled_id));
    let media = state.media();
    if let Err(err) = media.write(&output_rel, &png) {
        return fail_tiled(state, tiled_id, &format!("writing assembled image: {err}"));
    }
    let _ = media.remove(&thumb_rel);
    if let Err(err) = media.write(&thumb_rel, &thumb) {
        return fail_tiled(state, tiled_id, &format!("writing thumbnail: {err}"));
    }

    let mut store = state.store();
    if let Some(tiled) = store.tiled_jobs.get_mut(&tiled_id) {
        tiled.output_file = Some(output_rel);
        tiled.thumbnail = Some(thumb_rel);
        tiled.status = TiledJobStatus::Done;
        if tiled.completed_at.is_none() {
            tiled.completed_at = Some(Utc::now());
        }
    }
    Vec::new()
}

fn fail_tiled(state: &AppState, tiled_id: Uuid, reason: &str) -> Vec<Effect> {
    tracing::error!(tiled_job = %tiled_id, "tiled assembly failed: {reason}");
    let mut store = state.store();
    if let Some(tiled) = store.tiled_jobs.get_mut(&tiled_id) {
        tiled.status = TiledJobStatus::Error;
    }
    Vec::new()
}

async fn job_thumbnail(state: &AppState, job_id: u64) -> Vec<Effect> {
    let source = {
        let store = state.store();
        let Some(job) = store.jobs.get(&job_id) else {
            return Vec::new();
        };
        let Some(rel) = job.output_file.clone() else {
            return Vec::new();
        };
        let Some(project) = store
            .assets
            .get(&job.asset)
            .map(|a| a.project)
        else {
            return Vec::new();
        };
        (state.media().abs(&rel), rel, project, job.animation)
    };
    let (abs, source_rel, project, animation) = source;

    let thumb = tokio::task::spawn_blocking(move || thumbs::thumbnail_png_from_path(&abs)).await;
    let thumb = match thumb {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            tracing::error!(job = job_id, "thumbnail generation failed: {err:#}");
            return Vec::new();
        }
        Err(err) => {
            tracing::error!(job = job_id, "thumbnail task join error: {err:#}");
            return Vec::new();
        }
    };

    let thumb_rel = MediaStore::thumbnail_rel(project, "job", &job_id.to_string());
    let media = state.media();
    let _ = media.remove(&thumb_rel);
    if let Err(err) = media.write(&thumb_rel, &thumb) {
        tracing::error!(job = job_id, "writing thumbnail failed: {err}");
        return Vec::new();
    }

    let mut store = state.store();
    if let Some(job) = store.jobs.get_mut(&job_id) {
        job.thumbnail = Some(thumb_rel);
    }
    drop(store);

    // A frame of a plain animation also becomes the animation's preview.
    if let Some(animation) = animation {
        return vec![Effect::AnimationThumbnail {
            animation,
            source_rel,
        }];
    }
    Vec::new()
}

async fn animation_thumbnail(state: &AppState, animation_id: u64, source_rel: &str) -> Vec<Effect> {
    let project = {
        let store = state.store();
        match store.animations.get(&animation_id) {
            Some(animation) => animation.project,
            None => return Vec::new(),
        }
    };

    let abs = state.media().abs(source_rel);
    let thumb = tokio::task::spawn_blocking(move || thumbs::thumbnail_png_from_path(&abs)).await;
    let thumb = match thumb {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            tracing::error!(animation = animation_id, "thumbnail generation failed: {err:#}");
            return Vec::new();
        }
        Err(err) => {
            tracing::error!(animation = animation_id, "thumbnail task join error: {err:#}");
            return Vec::new();
        }
    };

    // Deterministic path: remove any previous preview so storage never has
    // to de-collide by renaming.
    let thumb_rel = MediaStore::thumbnail_rel(project, "animation", &animation_id.to_string());
    let media = state.media();
    let _ = media.remove(&thumb_rel);
    if let Err(err) = media.write(&thumb_rel, &thumb) {
        tracing::error!(animation = animation_id, "writing thumbnail failed: {err}");
        return Vec::new();
    }

    let mut store = state.store();
    if let Some(animation) = store.animations.get_mut(&animation_id) {
        animation.thumbnail = Some(thumb_rel);
    }
    Vec::new()
}
