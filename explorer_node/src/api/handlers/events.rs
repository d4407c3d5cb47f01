use axum::{
    extract::{Path, Query, State},
    Json,
};

use super::{with_store, Page};
use crate::api::errors::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::api::validation::{is_plain_id, EventQueryParams};
use crate::storage::{EventFilter, LedgerEvent};

/// List events matching the query filters
pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventQueryParams>,
) -> ApiResult<Json<Page<LedgerEvent>>> {
    let filter = EventFilter::from_params(&params)?;
    let (limit, offset) = (filter.limit, filter.offset);

    let (items, total) = with_store(&state.store, move |store| {
        let items = store.query_events(&filter)?;
        let total = store.count_events(&filter)?;
        Ok::<_, ApiError>((items, total))
    })
    .await?;

    Ok(Json(Page {
        items,
        total,
        limit,
        offset,
    }))
}

/// Get a single event by id
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<LedgerEvent>> {
    if !is_plain_id(&event_id) {
        return Err(ApiError::validation_error("event_id", "Invalid event id"));
    }
    let id = event_id.clone();
    match with_store(&state.store, move |store| store.get_event(&id)).await? {
        Some(event) => Ok(Json(event)),
        None => Err(ApiError::event_not_found(&event_id)),
    }
}
