//! Expansion of parent submissions into atomic child jobs.
//!
//! Runs inside the parent's create call, so the children exist before the
//! create response is sent and a polling worker can pick them up immediately.

use std::collections::BTreeMap;

use chrono::Utc;
use renderfarm_protocol::{FrameStatus, JobStatus, settings};
use serde_json::{Value, json};

use crate::models::{Animation, AnimationFrame, Job, TiledJob};
use crate::store::{Store, StoreError};

fn child_job(store: &mut Store, parent: &Animation, name: String, frame: i32) -> Job {
    Job {
        id: store.next_job_id(),
        name,
        asset: parent.asset,
        output_file_pattern: parent.output_file_pattern.clone(),
        start_frame: frame,
        end_frame: frame,
        status: JobStatus::Queued,
        assigned_worker: None,
        submitted_at: Utc::now(),
        started_at: None,
        completed_at: None,
        blender_version: parent.blender_version.clone(),
        render_engine: parent.render_engine,
        render_device: parent.render_device,
        cycles_feature_set: parent.cycles_feature_set,
        render_settings: parent.render_settings.clone(),
        render_time_seconds: None,
        last_output: String::new(),
        error_message: String::new(),
        output_file: None,
        thumbnail: None,
        animation: Some(parent.id),
        tiled_job: None,
        animation_frame: None,
    }
}

/// Per-tile border overrides. Fractions are tile edges in the renderer's
/// border coordinate space (y grows upward, tile row 0 at the bottom).
fn tile_settings(
    base: &BTreeMap<String, Value>,
    tx: u32,
    ty: u32,
    tiles_x: u32,
    tiles_y: u32,
    resolution: Option<(u32, u32)>,
) -> BTreeMap<String, Value> {
    let mut settings_map = base.clone();
    settings_map.insert(settings::USE_BORDER.to_string(), json!(true));
    settings_map.insert(settings::CROP_TO_BORDER.to_string(), json!(true));
    settings_map.insert(
        settings::BORDER_MIN_X.to_string(),
        json!(tx as f64 / tiles_x as f64),
    );
    settings_map.insert(
        settings::BORDER_MAX_X.to_string(),
        json!((tx + 1) as f64 / tiles_x as f64),
    );
    settings_map.insert(
        settings::BORDER_MIN_Y.to_string(),
        json!(ty as f64 / tiles_y as f64),
    );
    settings_map.insert(
        settings::BORDER_MAX_Y.to_string(),
        json!((ty + 1) as f64 / tiles_y as f64),
    );
    if let Some((x, y)) = resolution {
        settings_map.insert(settings::RESOLUTION_X.to_string(), json!(x));
        settings_map.insert(settings::RESOLUTION_Y.to_string(), json!(y));
    }
    settings_map
}

fn insert_named_job(store: &mut Store, job: Job) -> Result<(), StoreError> {
    if store.job_name_taken(&job.name) {
        return Err(StoreError::Validation(format!(
            "job name {:?} is already taken",
            job.name
        )));
    }
    store.jobs.insert(job.id, job);
    Ok(())
}

/// One job per frame for a plain animation; for a tiled animation, one
/// frame record per frame plus one job per tile of that frame.
pub(crate) fn expand_animation(store: &mut Store, parent: &Animation) -> Result<(), StoreError> {
    match parent.tiling_config.grid() {
        None => {
            for frame in parent.frame_numbers() {
                let name = format!("{}_Frame_{frame:04}", parent.name);
                let job = child_job(store, parent, name, frame);
                insert_named_job(store, job)?;
            }
        }
        Some((tiles_x, tiles_y)) => {
            for frame in parent.frame_numbers() {
                let frame_record = AnimationFrame {
                    id: store.next_frame_id(),
                    animation: parent.id,
                    frame_number: frame,
                    status: FrameStatus::Pending,
                    output_file: None,
                    render_time_seconds: 0,
                    thumbnail: None,
                };
                let frame_id = frame_record.id;
                store.frames.insert(frame_id, frame_record);

                for ty in 0..tiles_y {
                    for tx in 0..tiles_x {
                        let name =
                            format!("{}_Frame_{frame:04}_Tile_{ty}_{tx}", parent.name);
                        let mut job = child_job(store, parent, name, frame);
                        job.animation_frame = Some(frame_id);
                        job.render_settings = tile_settings(
                            &parent.render_settings,
                            tx,
                            ty,
                            tiles_x,
                            tiles_y,
                            None,
                        );
                        insert_named_job(store, job)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// One job per tile of a high-resolution still.
pub(crate) fn expand_tiled_job(store: &mut Store, parent: &TiledJob) -> Result<(), StoreError> {
    for ty in 0..parent.tile_count_y {
        for tx in 0..parent.tile_count_x {
            let name = format!("{}_Tile_{ty}_{tx}", parent.name);
            let job = Job {
                id: store.next_job_id(),
                name,
                asset: parent.asset,
                output_file_pattern: format!("{}_tile_{ty}_{tx}_####", parent.name),
                start_frame: 1,
                end_frame: 1,
                status: JobStatus::Queued,
                assigned_worker: None,
                submitted_at: Utc::now(),
                started_at: None,
                completed_at: None,
                blender_version: parent.blender_version.clone(),
                render_engine: parent.render_engine,
                render_device: parent.render_device,
                cycles_feature_set: parent.cycles_feature_set,
                render_settings: tile_settings(
                    &parent.render_settings,
                    tx,
                    ty,
                    parent.tile_count_x,
                    parent.tile_count_y,
                    Some((parent.final_resolution_x, parent.final_resolution_y)),
                ),
                render_time_seconds: None,
                last_output: String::new(),
                error_message: String::new(),
                output_file: None,
                thumbnail: None,
                animation: None,
                tiled_job: Some(parent.id),
                animation_frame: None,
            };
            insert_named_job(store, job)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_settings_cover_the_unit_square() {
        let base = BTreeMap::new();
        let s = tile_settings(&base, 0, 0, 2, 2, Some((400, 400)));
        assert_eq!(s[settings::USE_BORDER], json!(true));
        assert_eq!(s[settings::CROP_TO_BORDER], json!(true));
        assert_eq!(s[settings::BORDER_MIN_X], json!(0.0));
        assert_eq!(s[settings::BORDER_MAX_X], json!(0.5));
        assert_eq!(s[settings::RESOLUTION_X], json!(400));

        let s = tile_settings(&base, 1, 1, 2, 2, None);
        assert_eq!(s[settings::BORDER_MIN_X], json!(0.5));
        assert_eq!(s[settings::BORDER_MAX_X], json!(1.0));
        assert_eq!(s[settings::BORDER_MIN_Y], json!(0.5));
        assert_eq!(s[settings::BORDER_MAX_Y], json!(1.0));
        assert!(!s.contains_key(settings::RESOLUTION_X));
    }

    #[test]
    fn tile_settings_preserve_caller_overrides() {
        let mut base = BTreeMap::new();
        base.insert(settings::SAMPLES.to_string(), json!(16));
        let s = tile_settings(&base, 0, 1, 3, 3, None);
        assert_eq!(s[settings::SAMPLES], json!(16));
        assert_eq!(s[settings::BORDER_MIN_Y], json!(1.0 / 3.0));
    }
}
