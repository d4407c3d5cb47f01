use axum::{extract::State, Json};
use serde::Serialize;

use super::with_store;
use crate::api::errors::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::storage::TemplateStats;

#[derive(Debug, Serialize)]
pub struct TemplateStatsResponse {
    pub templates: Vec<TemplateStats>,
    pub total_events: u64,
}

/// Per-template contract counts
pub async fn template_stats(State(state): State<AppState>) -> ApiResult<Json<TemplateStatsResponse>> {
    let (templates, total_events) = with_store(&state.store, |store| {
        Ok::<_, ApiError>((store.template_stats()?, store.event_count()?))
    })
    .await?;
    Ok(Json(TemplateStatsResponse {
        templates,
        total_events,
    }))
}
