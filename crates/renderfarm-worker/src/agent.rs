//! The worker agent main loop.
//!
//! Boot order: provision the LTS renderer (fatal on failure), detect
//! capabilities, register with the manager, then poll/claim/execute until
//! asked to stop. Transient network failures are logged and retried on the
//! next tick; nothing here backs off beyond the poll interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use renderfarm_protocol::{
    HeartbeatRequest, JobDto, JobStatus, JobUpdateRequest, WorkerCapabilities,
};
use tokio::sync::{mpsc, watch};

use crate::api::{self, ManagerError};
use crate::assets::AssetCache;
use crate::capabilities;
use crate::config::WorkerConfig;
use crate::invoker::{self, InvokerContext};
use crate::slots::{self, SlotKind, SlotTable};
use crate::tools::ToolStore;

const REGISTER_RETRY: Duration = Duration::from_secs(30);
const LAST_OUTPUT_TAIL_CHARS: usize = 4000;

struct Shared {
    http: reqwest::Client,
    config: WorkerConfig,
    tools: ToolStore,
    assets: AssetCache,
    gpus: Vec<renderfarm_protocol::GpuDeviceDto>,
    hostname: String,
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}

/// Run the agent until the shutdown flag flips and all in-flight work has
/// drained.
pub async fn run(config: WorkerConfig, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("building http client")?;

    for dir in [
        config.tools_dir(),
        config.assets_dir(),
        config.output_dir(),
        config.temp_dir(),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let tools = ToolStore::new(&config, http.clone())?;

    // A worker without a renderer is useless; failing the bootstrap aborts
    // startup rather than registering a machine that cannot execute.
    tracing::info!("ensuring latest LTS renderer ({}.x) is available", config.lts_series);
    tools
        .ensure_latest_lts(&config.lts_series)
        .await
        .context("provisioning bootstrap renderer")?;

    let gpus = capabilities::detect_physical_gpus(&config, &tools).await;
    let caps = WorkerCapabilities {
        blender_versions: tools.scan_local(),
        gpu_backends: capabilities::backends_of(&gpus),
        gpu_devices: gpus.clone(),
        cpu_threads: capabilities::cpu_threads(),
    };

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let register_req = HeartbeatRequest {
        hostname: hostname.clone(),
        ip_address: None,
        os: Some(format!(
            "{} {}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )),
        available_tools: Some(caps.clone()),
    };

    let mut worker_id = loop {
        match api::heartbeat(&http, &config.manager_url, &register_req).await {
            Ok(worker) => break worker.id,
            Err(err) => {
                tracing::error!(
                    "failed to register with manager: {err:#}; retrying in {REGISTER_RETRY:?}"
                );
                tokio::select! {
                    _ = tokio::time::sleep(REGISTER_RETRY) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    };
    tracing::info!("registered with manager as worker {worker_id}");

    let mut slot_table = SlotTable::new(&config, gpus.len());
    if slot_table.is_empty() {
        anyhow::bail!("configuration yields no executable slots (force_gpu_only without GPUs?)");
    }

    let assets = AssetCache::new(config.assets_dir());
    let shared = Arc::new(Shared {
        http,
        config,
        tools,
        assets,
        gpus,
        hostname,
    });

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<usize>();
    let mut poll_tick = tokio::time::interval(shared.config.poll_interval);
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_heartbeat = Instant::now();

    loop {
        tokio::select! {
            _ = poll_tick.tick() => {
                if *shutdown.borrow() {
                    if slot_table.all_idle() {
                        break;
                    }
                    continue;
                }

                if last_heartbeat.elapsed() >= shared.config.heartbeat_interval {
                    match api::heartbeat(
                        &shared.http,
                        &shared.config.manager_url,
                        &HeartbeatRequest {
                            hostname: shared.hostname.clone(),
                            ip_address: None,
                            os: None,
                            available_tools: None,
                        },
                    )
                    .await
                    {
                        Ok(_) => last_heartbeat = Instant::now(),
                        Err(err) if matches!(
                            err.downcast_ref::<ManagerError>(),
                            Some(ManagerError::UnknownWorker)
                        ) => {
                            tracing::warn!("manager no longer knows this worker; re-registering");
                            match api::heartbeat(&shared.http, &shared.config.manager_url, &register_req)
                                .await
                            {
                                Ok(worker) => {
                                    worker_id = worker.id;
                                    last_heartbeat = Instant::now();
                                    tracing::info!("re-registered as worker {worker_id}");
                                }
                                Err(err) => tracing::error!("re-registration failed: {err:#}"),
                            }
                        }
                        Err(err) => tracing::warn!("heartbeat failed: {err:#}"),
                    }
                }

                // Admissibility changes as slots fill (the default-mode
                // single-process gate, the split-mode CPU gate), so it is
                // re-evaluated after every claim instead of snapshotted.
                let mut tried = Vec::new();
                loop {
                    let next = slot_table
                        .free_admissible()
                        .into_iter()
                        .find(|idx| !tried.contains(idx));
                    let Some(slot_idx) = next else { break };
                    tried.push(slot_idx);

                    let kind = slot_table.kind(slot_idx);
                    if let Some(job) = claim_one(&shared, kind, worker_id).await {
                        slot_table.set_busy(slot_idx, true);
                        let shared = shared.clone();
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            process_job(&shared, job, kind).await;
                            let _ = done_tx.send(slot_idx);
                        });
                    }
                }
            }
            Some(slot_idx) = done_rx.recv() => {
                slot_table.set_busy(slot_idx, false);
                if *shutdown.borrow() && slot_table.all_idle() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("stop requested; finishing in-flight jobs");
                    if slot_table.all_idle() {
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("worker agent stopped");
    Ok(())
}

/// Poll with the slot's device filter and claim the first available job.
/// Claim races are expected; losing one just moves on to the next candidate.
async fn claim_one(shared: &Shared, kind: SlotKind, worker_id: u64) -> Option<JobDto> {
    let gpu_flag = slots::poll_flag(kind, &shared.config);
    let jobs = match api::poll_jobs(&shared.http, &shared.config.manager_url, gpu_flag).await {
        Ok(jobs) => jobs,
        Err(err) => {
            tracing::warn!("could not poll for jobs: {err:#}");
            return None;
        }
    };
    if jobs.is_empty() {
        return None;
    }
    tracing::info!("found {} available job(s)", jobs.len());

    for job in jobs {
        match api::claim_job(&shared.http, &shared.config.manager_url, job.id, worker_id).await {
            Ok(()) => {
                tracing::info!("claimed job '{}' (id {})", job.name, job.id);
                return Some(job);
            }
            Err(err)
                if matches!(
                    err.downcast_ref::<ManagerError>(),
                    Some(ManagerError::ClaimConflict)
                ) =>
            {
                tracing::debug!("job {} was claimed by another worker", job.id);
            }
            Err(err) => {
                tracing::error!("failed to claim job {}: {err:#}", job.id);
                return None;
            }
        }
    }
    None
}

async fn process_job(shared: &Shared, job: JobDto, kind: SlotKind) {
    let base = &shared.config.manager_url;

    if let Err(err) = api::update_job(
        &shared.http,
        base,
        job.id,
        &JobUpdateRequest {
            status: Some(JobStatus::Rendering),
            started_at: Some(Utc::now()),
            ..Default::default()
        },
    )
    .await
    {
        tracing::error!("could not mark job {} as rendering: {err:#}", job.id);
    }

    let (assigned_gpu, force_cpu) = match kind {
        SlotKind::Gpu(pinned) => (pinned, false),
        SlotKind::Cpu => (
            None,
            slots::cpu_fallback(kind, &shared.config, job.render_device),
        ),
    };

    let ctx = InvokerContext {
        http: &shared.http,
        config: &shared.config,
        tools: &shared.tools,
        assets: &shared.assets,
        gpus: &shared.gpus,
    };
    let outcome = invoker::execute_job(&ctx, &job, assigned_gpu, force_cpu).await;

    // Upload before the terminal report so the manager's aggregation sees
    // the artifact the moment the job counts as finished.
    let mut error_message = outcome.error_message.clone();
    let mut success = outcome.success;
    if success {
        if let Some(path) = &outcome.output_path {
            match api::upload_output(&shared.http, base, job.id, path).await {
                Ok(_) => tracing::info!("uploaded output for job {}", job.id),
                Err(err) => {
                    success = false;
                    error_message = format!("render succeeded but output upload failed: {err:#}");
                    tracing::error!("{error_message}");
                }
            }
        }
    }

    let status = if success {
        JobStatus::Done
    } else if outcome.was_canceled {
        JobStatus::Canceled
    } else {
        JobStatus::Error
    };
    let report = JobUpdateRequest {
        status: Some(status),
        completed_at: Some(Utc::now()),
        render_time_seconds: Some(outcome.render_seconds),
        last_output: Some(tail(&outcome.stdout, LAST_OUTPUT_TAIL_CHARS)),
        error_message: Some(error_message),
        ..Default::default()
    };
    match api::update_job(&shared.http, base, job.id, &report).await {
        Ok(_) => tracing::info!("reported final status {status} for job {}", job.id),
        Err(err) => tracing::error!(
            "failed to report final status for job {}: {err:#}",
            job.id
        ),
    }
}
