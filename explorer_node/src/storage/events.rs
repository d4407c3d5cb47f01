use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::security::sql_sanitize::{SortOrder, DEFAULT_LIMIT};

/// Kind of ledger event recorded for a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Exercised,
    Archived,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Exercised => "exercised",
            EventType::Archived => "archived",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single contract event as ingested from the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_id: String,
    pub update_id: String,
    pub event_type: EventType,
    pub contract_id: String,
    pub template_id: String,
    /// Choice name for exercised events
    #[serde(default)]
    pub choice: Option<String>,
    /// Exercise archives the contract
    #[serde(default)]
    pub consuming: bool,
    #[serde(default)]
    pub signatories: Vec<String>,
    #[serde(default)]
    pub observers: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub effective_at: DateTime<Utc>,
    pub record_time: DateTime<Utc>,
}

impl LedgerEvent {
    /// Whether this event ends the contract's lifetime
    pub fn is_archival(&self) -> bool {
        match self.event_type {
            EventType::Archived => true,
            EventType::Exercised => self.consuming,
            EventType::Created => false,
        }
    }
}

/// Fixed-width UTC form used for storage so lexical order is time order
pub fn storage_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Column a list query may be ordered by
pub const EVENT_SORT_COLUMNS: [&str; 2] = ["record_time", "effective_at"];

/// Already-sanitized filter for event list queries
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub template_id: Option<String>,
    pub contract_id: Option<String>,
    pub party: Option<String>,
    /// LIKE-escaped search text
    pub search: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub sort_column: &'static str,
    pub order: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            event_type: None,
            template_id: None,
            contract_id: None,
            party: None,
            search: None,
            from: None,
            to: None,
            sort_column: EVENT_SORT_COLUMNS[0],
            order: SortOrder::Desc,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Filter for active contract set snapshots
#[derive(Debug, Clone, PartialEq)]
pub struct AcsFilter {
    pub template_id: Option<String>,
    pub as_of: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for AcsFilter {
    fn default() -> Self {
        Self {
            template_id: None,
            as_of: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStats {
    pub template_id: String,
    /// Distinct contracts created
    pub created: u64,
    pub exercised: u64,
    /// Distinct contracts archived
    pub archived: u64,
    pub active: u64,
}
