//! Renderer subprocess supervision.
//!
//! One invocation per job: resolve inputs (asset, renderer binary), emit the
//! configuration preamble, launch the subprocess with both pipes drained by
//! reader tasks, and watch the job record for a server-side cancel while it
//! runs. Cancellation kills the whole process tree.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use renderfarm_protocol::{GpuDeviceDto, JobDto, JobStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::api;
use crate::assets::AssetCache;
use crate::capabilities;
use crate::config::WorkerConfig;
use crate::preamble::{self, PreambleSpec};
use crate::tools::ToolStore;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);
const STDERR_TAIL_CHARS: usize = 500;
const MAX_CAPTURED_LINES: usize = 10_000;

#[derive(Debug)]
pub(crate) struct RenderOutcome {
    pub success: bool,
    pub was_canceled: bool,
    pub stdout: String,
    pub stderr: String,
    pub error_message: String,
    pub output_path: Option<PathBuf>,
    pub render_seconds: u64,
}

impl RenderOutcome {
    fn failed(message: String, started: Instant) -> Self {
        RenderOutcome {
            success: false,
            was_canceled: false,
            stdout: String::new(),
            stderr: String::new(),
            error_message: message,
            output_path: None,
            render_seconds: elapsed_seconds(started),
        }
    }
}

fn elapsed_seconds(started: Instant) -> u64 {
    started.elapsed().as_secs_f64().ceil() as u64
}

pub(crate) struct InvokerContext<'a> {
    pub http: &'a reqwest::Client,
    pub config: &'a WorkerConfig,
    pub tools: &'a ToolStore,
    pub assets: &'a AssetCache,
    pub gpus: &'a [GpuDeviceDto],
}

/// The `--threads` policy: a manual override always wins; a default-mode
/// worker with GPUs leaves one host thread per card for driver work;
/// everything else lets the renderer decide.
pub(crate) fn threads_flag(config: &WorkerConfig, gpu_count: usize) -> Option<u32> {
    if let Some(threads) = config.cpu_threads {
        return Some(threads);
    }
    if !config.gpu_split_mode && !config.force_cpu_only && !config.force_gpu_only && gpu_count > 0 {
        return Some(capabilities::cpu_threads().saturating_sub(gpu_count as u32).max(1));
    }
    None
}

/// Where the renderer will write a single-frame result for this pattern.
fn single_frame_output(pattern: &Path, frame: i32) -> PathBuf {
    let raw = pattern.to_string_lossy();
    let with_frame = if raw.contains("####") {
        raw.replace("####", &format!("{frame:04}"))
    } else {
        format!("{raw}{frame:04}")
    };
    PathBuf::from(format!("{with_frame}.png"))
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return "No stderr output.".to_string();
    }
    let count = trimmed.chars().count();
    trimmed
        .chars()
        .skip(count.saturating_sub(STDERR_TAIL_CHARS))
        .collect()
}

async fn read_lines<R>(stream: R) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut captured: VecDeque<String> = VecDeque::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if captured.len() == MAX_CAPTURED_LINES {
            captured.pop_front();
        }
        captured.push_back(line);
    }
    let mut out = String::new();
    for line in captured {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_tree(child: &Child) {
    // The child leads its own process group, so one signal reaches every
    // descendant along with the root.
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &Child) {
    let _ = child;
}

pub(crate) async fn execute_job(
    ctx: &InvokerContext<'_>,
    job: &JobDto,
    assigned_gpu_index: Option<usize>,
    force_cpu_fallback: bool,
) -> RenderOutcome {
    let started = Instant::now();
    let job_id = job.id;
    tracing::info!("[Job {job_id}] Received job '{}'", job.name);

    let blend_file = match ctx
        .assets
        .ensure(ctx.http, &ctx.config.manager_url, &job.asset)
        .await
    {
        Ok(path) => path,
        Err(err) => {
            return RenderOutcome::failed(
                format!("Failed to download or find the required scene asset: {err:#}"),
                started,
            );
        }
    };

    let blender = match ctx.tools.ensure_available(&job.blender_version).await {
        Ok(path) => path,
        Err(err) => {
            return RenderOutcome::failed(
                format!(
                    "Could not find or acquire renderer version '{}': {err:#}",
                    job.blender_version
                ),
                started,
            );
        }
    };
    tracing::info!("[Job {job_id}] Using renderer executable: {}", blender.display());

    let target_gpu_index = assigned_gpu_index.or(ctx.config.force_gpu_index);
    if let Some(index) = target_gpu_index {
        match ctx.gpus.get(index) {
            Some(gpu) => {
                tracing::info!("[Job {job_id}] Assigning to [Physical GPU {index}] {}", gpu.name);
            }
            None => {
                tracing::warn!(
                    "[Job {job_id}] Requested GPU index {index} is outside the detected range; the renderer will use all available GPUs"
                );
            }
        }
    }
    if force_cpu_fallback {
        tracing::info!("[Job {job_id}] [CPU Fallback] Forcing CPU configuration for 'ANY' job");
    }

    let backends = capabilities::backends_of(ctx.gpus);
    let script = preamble::generate(&PreambleSpec {
        engine: job.render_engine,
        device: job.render_device,
        settings: &job.render_settings,
        detected_backends: &backends,
        target_gpu_index,
        force_cpu: force_cpu_fallback,
    });

    let temp_dir = ctx.config.temp_dir();
    let script_path = temp_dir.join(format!("job_{job_id}_preamble.py"));
    if let Err(err) = tokio::fs::create_dir_all(&temp_dir).await {
        return RenderOutcome::failed(format!("creating temp dir: {err}"), started);
    }
    if let Err(err) = tokio::fs::write(&script_path, &script).await {
        return RenderOutcome::failed(format!("writing render preamble: {err}"), started);
    }
    tracing::debug!("[Job {job_id}] preamble:\n{script}");

    let output_pattern = ctx.config.output_dir().join(&job.output_file_pattern);
    if let Some(parent) = output_pattern.parent() {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            let _ = tokio::fs::remove_file(&script_path).await;
            return RenderOutcome::failed(format!("creating output dir: {err}"), started);
        }
    }

    let mut command = Command::new(&blender);
    command
        .arg("--factory-startup")
        .arg("-b")
        .arg(&blend_file)
        .arg("--python")
        .arg(&script_path)
        .arg("-o")
        .arg(&output_pattern)
        .arg("-F")
        .arg("PNG");
    if job.start_frame == job.end_frame {
        command.arg("-f").arg(job.start_frame.to_string());
    } else {
        command
            .arg("-s")
            .arg(job.start_frame.to_string())
            .arg("-e")
            .arg(job.end_frame.to_string())
            .arg("-a");
    }
    if let Some(threads) = threads_flag(ctx.config, ctx.gpus.len()) {
        command.arg("--threads").arg(threads.to_string());
    }
    command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    tracing::info!("[Job {job_id}] Running: {command:?}");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let _ = tokio::fs::remove_file(&script_path).await;
            return RenderOutcome::failed(format!("spawning renderer: {err}"), started);
        }
    };
    tracing::info!("[Job {job_id}] Renderer subprocess launched (pid {:?})", child.id());

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_lines(out)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_lines(err)));

    let mut was_canceled = false;
    let exit = loop {
        // wait() is cancel-safe, so bounding it with the poll interval and
        // retrying loses nothing.
        match tokio::time::timeout(CANCEL_POLL_INTERVAL, child.wait()).await {
            Ok(status) => break status,
            Err(_) if was_canceled => continue,
            Err(_) => {
                match api::fetch_job(ctx.http, &ctx.config.manager_url, job_id).await {
                    Ok(current) if current.status == JobStatus::Canceled => {
                        tracing::warn!(
                            "[Job {job_id}] Cancellation received; killing renderer process tree"
                        );
                        kill_process_tree(&child);
                        let _ = child.start_kill();
                        was_canceled = true;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("[Job {job_id}] cancel poll failed: {err:#}");
                    }
                }
            }
        }
    };

    let stdout = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    let _ = tokio::fs::remove_file(&script_path).await;

    let render_seconds = elapsed_seconds(started);

    let exit = match exit {
        Ok(status) => status,
        Err(err) => {
            return RenderOutcome {
                success: false,
                was_canceled,
                stdout,
                stderr,
                error_message: format!("waiting on renderer: {err}"),
                output_path: None,
                render_seconds,
            };
        }
    };

    if was_canceled {
        tracing::info!("[Job {job_id}] Result: CANCELED");
        return RenderOutcome {
            success: false,
            was_canceled: true,
            stdout,
            stderr,
            error_message: "Job was canceled by user request.".to_string(),
            output_path: None,
            render_seconds,
        };
    }

    if exit.success() {
        let output_path = (job.start_frame == job.end_frame)
            .then(|| single_frame_output(&output_pattern, job.start_frame));
        tracing::info!(
            "[Job {job_id}] Result: SUCCESS{}",
            output_path
                .as_deref()
                .map(|p| format!(" (output {})", p.display()))
                .unwrap_or_default()
        );
        return RenderOutcome {
            success: true,
            was_canceled: false,
            stdout,
            stderr,
            error_message: String::new(),
            output_path,
            render_seconds,
        };
    }

    let message = format!("Renderer exited with {exit}. Details: {}", stderr_tail(&stderr));
    tracing::error!("[Job {job_id}] Result: FAILED. {message}");
    RenderOutcome {
        success: false,
        was_canceled: false,
        stdout,
        stderr,
        error_message: message,
        output_path: None,
        render_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, Overrides, WorkerConfig};

    fn config(overrides: Overrides) -> WorkerConfig {
        WorkerConfig::resolve(FileConfig::default(), overrides).unwrap()
    }

    #[test]
    fn manual_thread_override_always_wins() {
        let cfg = config(Overrides {
            cpu_threads: Some(3),
            gpu_split_mode: Some(true),
            ..Default::default()
        });
        assert_eq!(threads_flag(&cfg, 2), Some(3));
    }

    #[test]
    fn default_mode_mixed_hardware_reserves_driver_headroom() {
        let cfg = config(Overrides::default());
        let host = capabilities::cpu_threads();
        assert_eq!(threads_flag(&cfg, 2), Some(host.saturating_sub(2).max(1)));
        // CPU-only hardware: let the renderer decide.
        assert_eq!(threads_flag(&cfg, 0), None);
    }

    #[test]
    fn forced_and_split_modes_omit_the_flag() {
        let forced = config(Overrides {
            force_cpu_only: Some(true),
            ..Default::default()
        });
        assert_eq!(threads_flag(&forced, 2), None);

        let split = config(Overrides {
            gpu_split_mode: Some(true),
            ..Default::default()
        });
        assert_eq!(threads_flag(&split, 2), None);
    }

    #[test]
    fn single_frame_output_substitutes_frame_padding() {
        assert_eq!(
            single_frame_output(Path::new("/out/shot_####"), 7),
            Path::new("/out/shot_0007.png")
        );
        assert_eq!(
            single_frame_output(Path::new("/out/shot_"), 12),
            Path::new("/out/shot_0012.png")
        );
    }

    #[test]
    fn stderr_tail_is_bounded_and_never_empty() {
        assert_eq!(stderr_tail("  "), "No stderr output.");
        let long = "x".repeat(2000);
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL_CHARS);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_kills_the_subprocess_within_the_poll_bound() {
        use std::os::unix::fs::PermissionsExt;

        use serde_json::{Value, json};

        let tmp = tempfile::TempDir::new().unwrap();
        let media = renderfarm_manager::MediaStore::new(tmp.path().join("media")).unwrap();
        let state = renderfarm_manager::AppState::new(media);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, renderfarm_manager::app(state)).await.unwrap();
        });
        let client = reqwest::Client::new();

        let project: Value = client
            .post(format!("http://{addr}/api/projects"))
            .json(&json!({ "name": "Cancel Bound" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let form = reqwest::multipart::Form::new()
            .text("name", "cancel-scene")
            .text("project", project["id"].as_str().unwrap().to_string())
            .part(
                "blend_file",
                reqwest::multipart::Part::bytes(b"scene".to_vec()).file_name("scene.blend"),
            );
        let asset: Value = client
            .post(format!("http://{addr}/api/assets"))
            .multipart(form)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let created: Value = client
            .post(format!("http://{addr}/api/jobs"))
            .json(&json!({
                "name": "Endless Render",
                "asset_id": asset["id"].as_u64().unwrap(),
                "output_file_pattern": "endless_####",
                "render_device": "CPU",
                "blender_version": "4.5.1",
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let job_id = created["id"].as_u64().unwrap();

        let cfg = config(Overrides {
            manager_url: Some(format!("http://{addr}")),
            working_dir: Some(tmp.path().join("worker")),
            ..Default::default()
        });

        // A renderer that never finishes on its own.
        let platform = crate::tools::current_platform().unwrap();
        let mut exe = cfg
            .tools_dir()
            .join("blender")
            .join(format!("blender-4.5.1-{}", platform.id));
        for part in platform.exe_rel {
            exe = exe.join(part);
        }
        std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
        std::fs::write(&exe, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let worker: Value = client
            .post(format!("http://{addr}/api/heartbeat"))
            .json(&json!({
                "hostname": "cancel-host",
                "available_tools": { "blender_versions": ["4.5.1"], "cpu_threads": 4 }
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        crate::api::claim_job(&client, &cfg.manager_url, job_id, worker["id"].as_u64().unwrap())
            .await
            .unwrap();
        crate::api::update_job(
            &client,
            &cfg.manager_url,
            job_id,
            &renderfarm_protocol::JobUpdateRequest {
                status: Some(JobStatus::Rendering),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let cancel_client = client.clone();
        let cancel_url = format!("http://{addr}/api/jobs/{job_id}/cancel");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel_client.post(cancel_url).send().await.unwrap();
        });

        let tools = crate::tools::ToolStore::new(&cfg, client.clone()).unwrap();
        let assets = AssetCache::new(cfg.assets_dir());
        let ctx = InvokerContext {
            http: &client,
            config: &cfg,
            tools: &tools,
            assets: &assets,
            gpus: &[],
        };

        let job = crate::api::fetch_job(&client, &cfg.manager_url, job_id).await.unwrap();
        let started = Instant::now();
        let outcome = execute_job(&ctx, &job, None, false).await;

        assert!(outcome.was_canceled);
        assert!(!outcome.success);
        assert_eq!(outcome.error_message, "Job was canceled by user request.");
        // Twice the poll interval plus slack, nowhere near the 30 s sleep.
        assert!(started.elapsed() < Duration::from_secs(15));
    }
}
