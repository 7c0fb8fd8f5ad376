use clap::Parser;
use tracing_subscriber::EnvFilter;

use renderfarm_manager::{AppState, MediaStore, app};

#[derive(Debug, Parser)]
#[command(name = "farm-manager", version, about = "Render farm manager")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "FARM_MANAGER_BIND", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Directory that holds assets, render outputs, and thumbnails.
    #[arg(long, env = "FARM_MEDIA_ROOT", default_value = "./media")]
    media_root: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let media = MediaStore::new(&cli.media_root)?;
    tracing::info!(media_root = %media.root().display(), "media root ready");

    let state = AppState::new(media);
    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "manager listening");

    axum::serve(listener, app(state)).await?;
    Ok(())
}
