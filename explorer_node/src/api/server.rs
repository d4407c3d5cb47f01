use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::api::cors::CorsConfig;
use crate::api::handlers::{admin, contracts, events, governance, stats, status};
use crate::config::{ConfigError, ExplorerConfig};
use crate::governance::{KeywordStageClassifier, StageClassifier};
use crate::security::auth::{auth_middleware, require_admin, Authenticator};
use crate::security::crash_log::CrashLogger;
use crate::security::rate_limiter::RateLimiter;
use crate::security::server_protection::{self, MemoryGuard, ProtectionState};
use crate::storage::LedgerStore;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LedgerStore>,
    pub config: Arc<ExplorerConfig>,
    pub memory: Arc<MemoryGuard>,
    pub rate_limiter: Arc<RateLimiter>,
    pub authenticator: Arc<Authenticator>,
    pub crash_log: Arc<CrashLogger>,
    pub stage_classifier: Arc<dyn StageClassifier>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ExplorerConfig, store: LedgerStore) -> Self {
        Self {
            store: Arc::new(store),
            memory: Arc::new(MemoryGuard::new(config.protection.memory_limit_mb)),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            authenticator: Arc::new(Authenticator::from_config(&config.auth)),
            crash_log: Arc::new(CrashLogger::new(config.crash_log.path.clone())),
            stage_classifier: Arc::new(KeywordStageClassifier::new()),
            started_at: Instant::now(),
            config: Arc::new(config),
        }
    }

    fn protection(&self) -> ProtectionState {
        ProtectionState {
            memory: self.memory.clone(),
            rate_limiter: self.rate_limiter.clone(),
            authenticator: self.authenticator.clone(),
            trust_proxy: self.config.server.trust_proxy,
        }
    }
}

// API Router
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/admin/events", post(admin::ingest_events))
        .route("/api/admin/crashes", get(admin::recent_crashes))
        .route("/api/admin/rate-limit/:ip", get(admin::rate_limit_status))
        .route_layer(middleware::from_fn(require_admin));

    let api_routes = Router::new()
        // Ledger data
        .route("/api/events", get(events::list_events))
        .route("/api/events/:event_id", get(events::get_event))
        .route("/api/contracts/:contract_id", get(contracts::get_contract))
        .route("/api/acs", get(contracts::list_active_contracts))
        .route("/api/stats/templates", get(stats::template_stats))
        // Governance
        .route("/api/governance/vote-requests", get(governance::list_vote_requests))
        .route("/api/governance/summary", get(governance::summary))
        .route("/api/governance/classify-stage", post(governance::classify_stage))
        .merge(admin_routes)
        .route_layer(middleware::from_fn_with_state(
            state.authenticator.clone(),
            auth_middleware,
        ));

    let router = Router::new()
        .route("/health", get(status::health))
        .merge(api_routes)
        .with_state(state.clone());

    let cors = CorsConfig::new(state.config.server.cors_origins.clone()).layer();
    server_protection::install(router, &state.config.protection, state.protection(), cors)
}

/// Run the API until Ctrl-C, with background memory and rate-limit maintenance
pub async fn serve(state: AppState) -> Result<(), ServerError> {
    let addr = state.config.listen_addr()?;
    let protection = &state.config.protection;

    if protection.memory_limit_mb.is_some() {
        state
            .memory
            .clone()
            .spawn_monitor(Duration::from_secs(protection.memory_poll_secs));
    }
    server_protection::spawn_maintenance(
        state.rate_limiter.clone(),
        Duration::from_secs(protection.rate_limit_cleanup_secs),
    );

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Explorer API listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Explorer API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
