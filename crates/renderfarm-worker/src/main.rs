use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use renderfarm_worker::config::{FileConfig, Overrides, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "farm-worker", version, about = "Render farm worker agent")]
struct Cli {
    /// Optional TOML config file; flags and environment override it.
    #[arg(long, env = "FARM_WORKER_CONFIG")]
    config_file: Option<PathBuf>,

    #[arg(long, env = "FARM_MANAGER_URL")]
    manager_url: Option<String>,

    #[arg(long, env = "FARM_POLL_INTERVAL")]
    poll_interval_seconds: Option<u64>,

    #[arg(long, env = "FARM_HEARTBEAT_INTERVAL")]
    heartbeat_interval_seconds: Option<u64>,

    /// Report no GPUs and only take CPU work.
    #[arg(long, env = "FARM_FORCE_CPU_ONLY")]
    force_cpu_only: Option<bool>,

    /// Only take GPU work.
    #[arg(long, env = "FARM_FORCE_GPU_ONLY")]
    force_gpu_only: Option<bool>,

    /// Pin every render to one physical GPU index.
    #[arg(long, env = "FARM_FORCE_GPU_INDEX")]
    force_gpu_index: Option<usize>,

    /// One slot per physical GPU, each running its own render.
    #[arg(long, env = "FARM_GPU_SPLIT_MODE")]
    gpu_split_mode: Option<bool>,

    /// Manual --threads value passed to the renderer.
    #[arg(long, env = "FARM_CPU_THREADS")]
    cpu_threads: Option<u32>,

    /// Root for managed tools, cached assets, and render output.
    #[arg(long, env = "FARM_WORKER_DIR")]
    working_dir: Option<PathBuf>,

    /// Renderer release catalog URL.
    #[arg(long, env = "FARM_TOOL_CATALOG_URL")]
    tool_catalog_url: Option<String>,

    /// Renderer LTS series provisioned at boot (e.g. "4.5").
    #[arg(long, env = "FARM_LTS_SERIES")]
    lts_series: Option<String>,
}

fn spawn_ctrl_c_handler(stop_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut presses: u8 = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            presses = presses.saturating_add(1);
            if presses == 1 {
                tracing::info!(
                    "Stop requested — finishing in-flight jobs (press CTRL+C again to exit immediately)."
                );
                let _ = stop_tx.send(true);
            } else {
                tracing::warn!("Stop requested again — exiting immediately.");
                std::process::exit(130);
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let file = match &cli.config_file {
        Some(path) => FileConfig::load(path)
            .map_err(|err| anyhow::anyhow!("reading {}: {err:#}", path.display()))?,
        None => {
            let default_path = PathBuf::from("farm-worker.toml");
            if default_path.is_file() {
                FileConfig::load(&default_path)
                    .map_err(|err| anyhow::anyhow!("reading {}: {err:#}", default_path.display()))?
            } else {
                FileConfig::default()
            }
        }
    };

    let config = WorkerConfig::resolve(
        file,
        Overrides {
            manager_url: cli.manager_url,
            poll_interval_seconds: cli.poll_interval_seconds,
            heartbeat_interval_seconds: cli.heartbeat_interval_seconds,
            force_cpu_only: cli.force_cpu_only,
            force_gpu_only: cli.force_gpu_only,
            force_gpu_index: cli.force_gpu_index,
            gpu_split_mode: cli.gpu_split_mode,
            cpu_threads: cli.cpu_threads,
            working_dir: cli.working_dir,
            tool_catalog_url: cli.tool_catalog_url,
            lts_series: cli.lts_series,
        },
    )?;

    tracing::info!(
        "farm-worker {} starting (manager {}, split_mode={})",
        env!("CARGO_PKG_VERSION"),
        config.manager_url,
        config.gpu_split_mode
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    spawn_ctrl_c_handler(stop_tx);

    renderfarm_worker::agent::run(config, stop_rx).await
}
