//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::probe::LinkSpeedProbe;
use crate::scheduler::{CredentialResolver, Device, LivenessPoller, MonitoringPolicy, ReachabilityPoller};
use crate::storage::{BoardSnapshot, BoardStore, LogStore, SecretStore};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Largest accepted request body (board documents included).
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub board: Arc<BoardStore>,
    pub secrets: Arc<SecretStore>,
    pub logs: Arc<LogStore>,
    pub reachability: Arc<ReachabilityPoller>,
    pub liveness: Arc<LivenessPoller>,
    pub link_speed: Arc<dyn LinkSpeedProbe>,
    /// Last device list pushed from the board, before credential overrides.
    devices: Arc<RwLock<Vec<Device>>>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        board: Arc<BoardStore>,
        secrets: Arc<SecretStore>,
        logs: Arc<LogStore>,
        reachability: Arc<ReachabilityPoller>,
        liveness: Arc<LivenessPoller>,
        link_speed: Arc<dyn LinkSpeedProbe>,
    ) -> Self {
        Self {
            config,
            board,
            secrets,
            logs,
            reachability,
            liveness,
            link_speed,
            devices: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Feed a board document to both pollers. Undecodable documents are ignored.
    pub async fn apply_board(&self, bytes: &[u8]) {
        match BoardSnapshot::parse(bytes) {
            Ok(snapshot) => self.push(snapshot.devices, Some(snapshot.policy)).await,
            Err(e) => tracing::debug!("Board not applied to monitoring: {}", e),
        }
    }

    /// Replace the device list of both pollers, keeping the current policy.
    pub async fn apply_devices(&self, devices: Vec<Device>) {
        self.push(devices, None).await;
    }

    /// Re-resolve liveness bits after a credential change.
    pub async fn refresh_liveness(&self) {
        let stored = self.devices.write().await;
        let resolved = resolve_liveness(self.secrets.as_ref(), stored.clone());
        self.liveness.update_targets(resolved).await;
    }

    /// The device list guard is held until both pollers are updated, so
    /// concurrent pushes reach the pollers in the order they are stored.
    async fn push(&self, devices: Vec<Device>, policy: Option<MonitoringPolicy>) {
        let mut stored = self.devices.write().await;
        *stored = devices.clone();

        let resolved = resolve_liveness(self.secrets.as_ref(), devices.clone());
        match policy {
            Some(policy) => self.reachability.update_from_board(devices, policy).await,
            None => self.reachability.update_targets(devices).await,
        }
        self.liveness.update_targets(resolved).await;
    }
}

/// Stored credentials decide liveness; without them the board's own flag stands.
pub fn resolve_liveness(resolver: &dyn CredentialResolver, mut devices: Vec<Device>) -> Vec<Device> {
    for device in devices.iter_mut() {
        let id = device.id.clone();
        let Some(host) = device.as_host_mut() else {
            continue;
        };
        match resolver.lookup(&id) {
            Ok(Some(credentials)) => host.liveness_enabled = credentials.connect_enabled,
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read device settings for {}: {}", id, e),
        }
    }
    devices
}

/// Web server for InfraMap.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
        let assets = ServeDir::new(&self.state.config.static_dir);

        Router::new()
            .route("/api/health", get(handlers::handle_health))
            .route("/api/board", get(handlers::handle_get_board).post(handlers::handle_save_board))
            .route("/api/status", get(handlers::handle_status))
            .route("/api/connect-status", get(handlers::handle_connect_status))
            .route("/api/logs", get(handlers::handle_logs))
            .route(
                "/api/monitoring",
                get(handlers::handle_get_monitoring).post(handlers::handle_set_monitoring),
            )
            .route("/api/monitoring/nodes", post(handlers::handle_monitoring_nodes))
            .route(
                "/api/device-settings/{id}",
                get(handlers::handle_get_device_settings)
                    .post(handlers::handle_save_device_settings)
                    .delete(handlers::handle_delete_device_settings),
            )
            .fallback_service(assets)
            .layer(cors)
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
