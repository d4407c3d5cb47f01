//! Ledger explorer query API
//!
//! Serves contract events, the active contract set, template statistics and
//! governance vote requests from a local SQLite store over JSON HTTP.

pub mod api;
pub mod config;
pub mod governance;
pub mod security;
pub mod storage;

pub use config::ExplorerConfig;
pub use storage::{LedgerEvent, LedgerStore};
