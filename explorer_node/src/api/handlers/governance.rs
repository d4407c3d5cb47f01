use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{json_rejection, with_store};
use crate::api::errors::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::governance::{
    load_vote_requests, GovernanceSummary, ProposalStatus, StageClassification, VoteRequestView,
};
use crate::security::sql_sanitize::sanitize_limit;

/// Longest text accepted for stage classification (in chars)
const MAX_CLASSIFY_LEN: usize = 20_000;

#[derive(Debug, Default, Deserialize)]
pub struct VoteRequestQuery {
    pub status: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VoteRequestList {
    pub items: Vec<VoteRequestView>,
    /// Matching requests before the limit was applied
    pub total: usize,
    pub sv_count: usize,
    pub voting_threshold: usize,
}

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub text: String,
}

/// Deduplicated VoteRequests with tally and status, newest first
pub async fn list_vote_requests(
    State(state): State<AppState>,
    Query(query): Query<VoteRequestQuery>,
) -> ApiResult<Json<VoteRequestList>> {
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(ProposalStatus::parse(raw).ok_or_else(|| {
            ApiError::validation_error(
                "status",
                "Expected in_progress, accepted, rejected, expired or closed",
            )
        })?),
        None => None,
    };
    let limit = sanitize_limit(query.limit.as_deref()) as usize;
    let sv_count = state.config.governance.sv_count;

    let template = state.config.governance.vote_request_template.clone();
    let requests = with_store(&state.store, move |store| load_vote_requests(store, &template)).await?;

    let now = Utc::now();
    let matching: Vec<VoteRequestView> = requests
        .into_iter()
        .map(|request| VoteRequestView::new(request, now, sv_count))
        .filter(|view| status.map_or(true, |s| view.status == s))
        .collect();
    let total = matching.len();

    Ok(Json(VoteRequestList {
        items: matching.into_iter().take(limit).collect(),
        total,
        sv_count,
        voting_threshold: crate::governance::voting_threshold(sv_count),
    }))
}

/// Counts of proposals per status and action
pub async fn summary(State(state): State<AppState>) -> ApiResult<Json<GovernanceSummary>> {
    let template = state.config.governance.vote_request_template.clone();
    let requests = with_store(&state.store, move |store| load_vote_requests(store, &template)).await?;
    Ok(Json(GovernanceSummary::from_requests(
        &requests,
        Utc::now(),
        state.config.governance.sv_count,
    )))
}

/// Assign a discussion stage to free text
pub async fn classify_stage(
    State(state): State<AppState>,
    body: Result<Json<ClassifyRequest>, JsonRejection>,
) -> ApiResult<Json<StageClassification>> {
    let Json(request) = body.map_err(json_rejection)?;
    if request.text.chars().count() > MAX_CLASSIFY_LEN {
        return Err(ApiError::validation_error("text", "Text too long"));
    }
    Ok(Json(state.stage_classifier.classify(&request.text)))
}
