//! Talkhead Server - resident talking-head rendering service

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talkhead_core::{Collaborators, RenderService, ServeConfig, ServerConfig};
use talkhead_server::{AppState, SessionServer};

/// Resident talking-head rendering service
#[derive(Parser, Debug)]
#[command(name = "talkhead-server", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "TALKHEAD_HOST")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8765", env = "TALKHEAD_PORT")]
    port: u16,

    /// JSON file with serving configuration; flags override it
    #[arg(long, value_name = "PATH", env = "TALKHEAD_CONFIG")]
    config: Option<PathBuf>,

    /// Feature cache directory
    #[arg(long, env = "TALKHEAD_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Accelerator ids to initialize, comma separated
    #[arg(long, env = "TALKHEAD_ACCELERATORS", value_delimiter = ',')]
    accelerators: Option<Vec<usize>>,

    /// Fixed batch size instead of deriving it from free memory
    #[arg(long, env = "TALKHEAD_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Frame rate used when a request does not name one
    #[arg(long, env = "TALKHEAD_FPS")]
    fps: Option<u32>,

    /// Longest request line accepted, in bytes
    #[arg(long, default_value = "1048576", env = "TALKHEAD_MAX_LINE_BYTES")]
    max_line_bytes: usize,

    /// Seconds shutdown waits for in-flight jobs
    #[arg(long, default_value = "300", env = "TALKHEAD_DRAIN_TIMEOUT")]
    drain_timeout: u64,
}

impl Args {
    fn serve_config(&self) -> anyhow::Result<ServeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => ServeConfig::default(),
        };
        if let Some(cache_dir) = &self.cache_dir {
            config.cache_dir = cache_dir.clone();
        }
        if let Some(accelerators) = &self.accelerators {
            config.accelerators = accelerators.clone();
        }
        if self.batch_size.is_some() {
            config.batch_size = self.batch_size;
        }
        if let Some(fps) = self.fps {
            config.default_fps = fps;
        }
        Ok(config)
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_line_bytes: self.max_line_bytes,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talkhead_server=debug,talkhead_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.serve_config()?;
    let server_config = args.server_config();

    info!("Starting Talkhead server");
    info!("Cache directory: {:?}", config.cache_dir);

    warn!("No model backend is linked in; serving with dry-run collaborators");
    let service = match RenderService::start(config, Collaborators::dry_run()).await {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to start render service: {}", e);
            return Err(e.into());
        }
    };
    info!(
        "Render service ready on accelerators {:?}",
        service.init_report().ready_ids()
    );

    let state = AppState::new(service.clone(), server_config.max_line_bytes)
        .with_drain_timeout(Some(Duration::from_secs(args.drain_timeout)));
    let server = SessionServer::bind(&server_config, state.clone())
        .await
        .with_context(|| format!("Failed to bind {}", server_config.addr()))?;
    info!("Server listening on {}", server.local_addr()?);

    tokio::spawn(shutdown_signal(state));

    info!("Server ready. Press Ctrl+C to stop.");
    server.run().await;

    service.release_accelerators();
    info!("Shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal, then drain like the `shutdown` command.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
        _ = state.shutdown_token().cancelled() => return,
    }
    state.shutdown().await;
}
