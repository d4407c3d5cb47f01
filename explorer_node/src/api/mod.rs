//! HTTP API for the ledger explorer

pub mod cors;
pub mod errors;
pub mod handlers;
pub mod server;
pub mod validation;

pub use errors::{ApiError, ApiResult, ValidationError, ValidationErrors};
pub use server::{create_router, serve, AppState, ServerError};
pub use validation::{AcsQueryParams, EventQueryParams, QueryRejection};
