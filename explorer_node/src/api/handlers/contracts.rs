use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::with_store;
use crate::api::errors::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::api::validation::AcsQueryParams;
use crate::security::sql_sanitize::sanitize_contract_id;
use crate::storage::{AcsFilter, EventType, LedgerEvent};

/// Lifetime of one contract reconstructed from its events
#[derive(Debug, Serialize)]
pub struct ContractResponse {
    pub contract_id: String,
    pub template_id: String,
    /// Whether an archival event has been recorded
    pub archived: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Events oldest first
    pub events: Vec<LedgerEvent>,
}

impl ContractResponse {
    fn from_history(contract_id: String, events: Vec<LedgerEvent>) -> Option<Self> {
        let first = events.first()?;
        let created_at = events
            .iter()
            .find(|e| e.event_type == EventType::Created)
            .map(|e| e.record_time);
        let archived_at = events.iter().find(|e| e.is_archival()).map(|e| e.record_time);
        Some(Self {
            contract_id,
            template_id: first.template_id.clone(),
            archived: archived_at.is_some(),
            created_at,
            archived_at,
            events,
        })
    }
}

/// Active contract set page
#[derive(Debug, Serialize)]
pub struct AcsResponse {
    pub items: Vec<LedgerEvent>,
    pub as_of: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Full event history of a contract
pub async fn get_contract(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<ContractResponse>> {
    let contract_id = sanitize_contract_id(&raw_id)
        .ok_or_else(|| ApiError::validation_error("contract_id", "Expected a hex contract id"))?;

    let id = contract_id.clone();
    let events = with_store(&state.store, move |store| store.contract_history(&id)).await?;
    ContractResponse::from_history(contract_id.clone(), events)
        .map(Json)
        .ok_or_else(|| ApiError::contract_not_found(&contract_id))
}

/// Contracts created and not archived as of a point in time
pub async fn list_active_contracts(
    State(state): State<AppState>,
    Query(params): Query<AcsQueryParams>,
) -> ApiResult<Json<AcsResponse>> {
    let filter = AcsFilter::from_params(&params)?;
    let (as_of, limit, offset) = (filter.as_of, filter.limit, filter.offset);
    let items = with_store(&state.store, move |store| store.active_contracts(&filter)).await?;
    Ok(Json(AcsResponse {
        items,
        as_of,
        limit,
        offset,
    }))
}
