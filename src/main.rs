//! InfraMap - infrastructure board with live device monitoring.
//!
//! Serves the board editor API and runs two background pollers: ICMP
//! reachability and SSH liveness.

mod config;
mod probe;
mod scheduler;
mod storage;
mod web;

use config::ServerConfig;
use probe::{PingProbe, SshProbe};
use scheduler::{LivenessPoller, ReachabilityPoller};
use storage::{BoardStore, LogStore, SecretStore};
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inframap=info,tower_http=info"));
    let json = std::env::var("RUST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting InfraMap on port {}...", cfg.http_port);
    tracing::info!("Using data directory {}", cfg.data_dir.display());

    // Storage
    let board = Arc::new(BoardStore::new(&cfg.data_dir));
    board.ensure()?;
    let secrets = Arc::new(SecretStore::open(cfg.secrets_key_path(), cfg.secrets_path())?);
    let logs = Arc::new(LogStore::new(cfg.log_capacity));

    // Pollers
    let reachability = Arc::new(ReachabilityPoller::new(Arc::new(PingProbe::default()), Some(logs.clone())));
    let ssh = Arc::new(SshProbe::default());
    let liveness = Arc::new(LivenessPoller::new(ssh.clone(), secrets.clone(), Some(logs.clone())));

    let state = AppState::new(
        cfg,
        board.clone(),
        secrets,
        logs,
        reachability.clone(),
        liveness.clone(),
        ssh,
    );

    // Seed both pollers from the stored board before serving
    let bytes = board.load()?;
    state.apply_board(&bytes).await;
    reachability.start();
    liveness.start();

    // Start web server
    let server = Server::new(state);
    server.start().await?;

    Ok(())
}
