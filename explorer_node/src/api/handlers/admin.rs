use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::{json_rejection, with_store};
use crate::api::errors::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::api::validation::validate_event;
use crate::security::crash_log::CrashReport;
use crate::security::rate_limiter::RateLimitStatus;
use crate::security::sql_sanitize::sanitize_limit;
use crate::storage::LedgerEvent;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub received: usize,
    /// Events not already stored
    pub inserted: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct CrashQuery {
    pub limit: Option<String>,
}

/// Store a batch of ledger events. The whole batch is rejected if any event is invalid.
pub async fn ingest_events(
    State(state): State<AppState>,
    body: Result<Json<Vec<LedgerEvent>>, JsonRejection>,
) -> ApiResult<Json<IngestResponse>> {
    let Json(events) = body.map_err(json_rejection)?;
    let received = events.len();

    let mut valid = Vec::with_capacity(received);
    let mut rejected = Vec::new();
    for (index, event) in events.into_iter().enumerate() {
        match validate_event(event) {
            Ok(event) => valid.push(event),
            Err(errors) => rejected.push(serde_json::json!({ "index": index, "errors": errors.errors })),
        }
    }
    if !rejected.is_empty() {
        return Err(ApiError::with_details(
            422,
            "Invalid events in batch".to_string(),
            serde_json::json!({ "rejected": rejected }),
        ));
    }

    let inserted = with_store(&state.store, move |store| store.insert_events(&valid)).await?;
    info!("Ingested {} new events ({} received)", inserted, received);
    Ok(Json(IngestResponse { received, inserted }))
}

/// Most recent crash reports, newest first
pub async fn recent_crashes(
    State(state): State<AppState>,
    Query(query): Query<CrashQuery>,
) -> ApiResult<Json<Vec<CrashReport>>> {
    let limit = sanitize_limit(query.limit.as_deref()) as usize;
    let logger = state.crash_log.clone();
    let reports = tokio::task::spawn_blocking(move || logger.recent(limit)).await??;
    Ok(Json(reports))
}

/// Rate-limit counters for one client address
pub async fn rate_limit_status(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Json<RateLimitStatus>> {
    if ip != "unknown" && ip.parse::<IpAddr>().is_err() {
        return Err(ApiError::validation_error("ip", "Expected an IP address"));
    }
    state
        .rate_limiter
        .ip_status(&ip)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No requests recorded for this client"))
}
