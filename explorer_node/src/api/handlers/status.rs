use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

use super::with_store;
use crate::api::errors::ApiError;
use crate::api::server::AppState;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Response for health check
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when storage fails or memory is over the limit
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub event_count: Option<u64>,
    pub latest_record_time: Option<DateTime<Utc>>,
    pub memory_mb: u64,
    pub memory_limit_mb: Option<u64>,
    pub overloaded: bool,
}

/// Health check; stays reachable under memory pressure
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_status = with_store(&state.store, |store| {
        Ok::<_, ApiError>((store.event_count()?, store.latest_record_time()?))
    })
    .await;

    let (event_count, latest_record_time, store_ok) = match store_status {
        Ok((count, latest)) => (Some(count), latest, true),
        Err(e) => {
            warn!("Health check could not read the store: {}", e);
            (None, None, false)
        }
    };
    let overloaded = state.memory.is_overloaded();

    Json(HealthResponse {
        status: if store_ok && !overloaded { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        event_count,
        latest_record_time,
        memory_mb: state.memory.last_sample_bytes() / BYTES_PER_MB,
        memory_limit_mb: state.memory.limit_mb(),
        overloaded,
    })
}
