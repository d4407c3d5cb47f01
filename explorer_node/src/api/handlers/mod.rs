pub mod admin;
pub mod contracts;
pub mod events;
pub mod governance;
pub mod stats;
pub mod status;

use axum::extract::rejection::JsonRejection;
use serde::Serialize;
use std::sync::Arc;

use crate::api::errors::{ApiError, ApiResult};
use crate::storage::LedgerStore;

/// One page of a list endpoint
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matching rows ignoring limit and offset
    pub total: u64,
    pub limit: i64,
    pub offset: i64,
}

/// Run a store call on the blocking pool
pub(crate) async fn with_store<T, E, F>(store: &Arc<LedgerStore>, f: F) -> ApiResult<T>
where
    F: FnOnce(&LedgerStore) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await?
        .map_err(Into::into)
}

/// Keep axum's status for a rejected JSON body (400, 413, 415 or 422)
pub(crate) fn json_rejection(rejection: JsonRejection) -> ApiError {
    ApiError::new(rejection.status().as_u16(), rejection.body_text())
}
