//! Dispatcher entry point. Wires `Config` -> `PoolRegistry` -> dispatcher
//! router and serves it with a `tokio::signal`-driven graceful shutdown
//! (SPEC_FULL.md §4.5 ambient addition). Entry-point shape follows the
//! teacher's `cli.rs::Cli` (`clap::Parser`), trimmed to the overrides this
//! binary actually needs.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sandbox_agent::config::Config;
use sandbox_agent::dispatcher::{self, AppState};
use sandbox_agent::registry::PoolRegistry;
use tracing::info;

/// Overrides the environment-variable configuration surface of spec.md §6.
/// CLI argument *semantics* are out of scope (spec.md §1); this is the
/// ambient minimum entry point a binary needs.
#[derive(Parser)]
#[command(author, version, about = "Warm execution-pool dispatcher")]
struct Cli {
    /// TCP port for the dispatcher (overrides AGENT_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Root of the environment cache (overrides CACHE_DIR).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Target workers per pool (overrides POOL_SIZE).
    #[arg(long)]
    pool_size: Option<usize>,

    /// Path to the sandbox-worker binary launched under nsjail.
    #[arg(long)]
    worker_bin: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.agent_port = port;
    }
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }
    if let Some(pool_size) = cli.pool_size {
        config.pool_size = pool_size;
    }
    let config = Arc::new(config);

    let worker_bin = cli
        .worker_bin
        .or_else(|| std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join("sandbox-worker"))))
        .unwrap_or_else(|| PathBuf::from("sandbox-worker"));

    let registry = Arc::new(PoolRegistry::new(config.clone(), worker_bin));
    let state = AppState {
        registry: registry.clone(),
        config: config.clone(),
        version_fingerprint: Arc::from(sandbox_agent::version_fingerprint()),
    };

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], config.agent_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "dispatcher listening");

    axum::serve(listener, dispatcher::app(state))
        .with_graceful_shutdown(dispatcher::shutdown_signal())
        .await?;

    info!("shutting down worker pools");
    registry.shutdown().await;

    Ok(())
}
