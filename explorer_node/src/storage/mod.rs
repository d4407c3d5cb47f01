//! Ledger event storage backing the explorer query API

pub mod events;
pub mod ledger_store;

pub use events::{AcsFilter, EventFilter, EventType, LedgerEvent, TemplateStats};
pub use ledger_store::LedgerStore;

use thiserror::Error;

// Storage-specific Result type
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage task failed: {0}")]
    Task(String),
}
