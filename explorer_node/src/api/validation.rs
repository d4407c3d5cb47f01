//! Request validation for the explorer API
//!
//! Raw query strings are turned into storage filters here. Every value that
//! reaches SQL passes through [`crate::security::sql_sanitize`] first.

use serde::Deserialize;

use crate::api::errors::{ApiError, ValidationErrors};
use crate::security::sql_sanitize::{
    detect_injection, sanitize_column, sanitize_contract_id, sanitize_event_type, sanitize_limit,
    sanitize_offset, sanitize_party_id, sanitize_search, sanitize_sort_order, sanitize_template_id,
    sanitize_timestamp, InjectionKind,
};
use crate::storage::events::EVENT_SORT_COLUMNS;
use crate::storage::{AcsFilter, EventFilter, EventType, LedgerEvent};

const MAX_ID_LEN: usize = 512;
const MAX_CHOICE_LEN: usize = 128;

/// Query string of `GET /api/events`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventQueryParams {
    pub event_type: Option<String>,
    pub template: Option<String>,
    pub contract_id: Option<String>,
    pub party: Option<String>,
    pub search: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub order: Option<String>,
    pub sort: Option<String>,
}

/// Query string of `GET /api/acs`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcsQueryParams {
    pub template: Option<String>,
    pub as_of: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

/// Why a query could not be turned into a filter
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRejection {
    Invalid(ValidationErrors),
    Injection { field: &'static str, kind: InjectionKind },
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        match rejection {
            QueryRejection::Invalid(errors) => errors.to_api_error(),
            QueryRejection::Injection { field, kind } => ApiError::injection_rejected(field, kind),
        }
    }
}

/// Treat absent and blank parameters the same
fn provided(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn check<T>(
    errors: &mut ValidationErrors,
    field: &str,
    raw: Option<&str>,
    message: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Option<T> {
    let raw = raw?;
    let parsed = parse(raw);
    if parsed.is_none() {
        errors.add_error(field, message, Some(raw));
    }
    parsed
}

impl EventFilter {
    pub fn from_params(params: &EventQueryParams) -> Result<EventFilter, QueryRejection> {
        let search = match provided(&params.search) {
            Some(raw) => {
                if let Some(kind) = detect_injection(raw) {
                    log::warn!("Rejected search parameter ({})", kind);
                    return Err(QueryRejection::Injection { field: "search", kind });
                }
                let escaped = sanitize_search(raw);
                (!escaped.is_empty()).then_some(escaped)
            }
            None => None,
        };

        let mut errors = ValidationErrors::new();
        let event_type = check(
            &mut errors,
            "event_type",
            provided(&params.event_type),
            "Expected created, exercised or archived",
            sanitize_event_type,
        );
        let template_id = check(
            &mut errors,
            "template",
            provided(&params.template),
            "Invalid template id",
            sanitize_template_id,
        );
        let contract_id = check(
            &mut errors,
            "contract_id",
            provided(&params.contract_id),
            "Invalid contract id",
            sanitize_contract_id,
        );
        let party = check(
            &mut errors,
            "party",
            provided(&params.party),
            "Invalid party id",
            sanitize_party_id,
        );
        let from = check(
            &mut errors,
            "from",
            provided(&params.from),
            "Invalid timestamp",
            sanitize_timestamp,
        );
        let to = check(
            &mut errors,
            "to",
            provided(&params.to),
            "Invalid timestamp",
            sanitize_timestamp,
        );
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                errors.add_error("from", "Must not be after 'to'", provided(&params.from));
            }
        }
        if !errors.is_empty() {
            return Err(QueryRejection::Invalid(errors));
        }

        Ok(EventFilter {
            event_type,
            template_id,
            contract_id,
            party,
            search,
            from,
            to,
            sort_column: sanitize_column(
                params.sort.as_deref(),
                &EVENT_SORT_COLUMNS,
                EVENT_SORT_COLUMNS[0],
            ),
            order: sanitize_sort_order(params.order.as_deref()),
            limit: sanitize_limit(params.limit.as_deref()),
            offset: sanitize_offset(params.offset.as_deref()),
        })
    }
}

impl AcsFilter {
    pub fn from_params(params: &AcsQueryParams) -> Result<AcsFilter, QueryRejection> {
        let mut errors = ValidationErrors::new();
        let template_id = check(
            &mut errors,
            "template",
            provided(&params.template),
            "Invalid template id",
            sanitize_template_id,
        );
        let as_of = check(
            &mut errors,
            "as_of",
            provided(&params.as_of),
            "Invalid timestamp",
            sanitize_timestamp,
        );
        if !errors.is_empty() {
            return Err(QueryRejection::Invalid(errors));
        }
        Ok(AcsFilter {
            template_id,
            as_of,
            limit: sanitize_limit(params.limit.as_deref()),
            offset: sanitize_offset(params.offset.as_deref()),
        })
    }
}

/// Opaque ledger id: non-empty, bounded, no whitespace or control characters
pub fn is_plain_id(raw: &str) -> bool {
    !raw.is_empty() && raw.len() <= MAX_ID_LEN && !raw.chars().any(|c| c.is_control() || c.is_whitespace())
}

fn is_choice_name(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_CHOICE_LEN
        && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check and normalize an event submitted for ingest.
///
/// Contract ids are lower-cased, and an exercised `Archive` choice is
/// marked consuming.
pub fn validate_event(mut event: LedgerEvent) -> Result<LedgerEvent, ValidationErrors> {
    let mut errors = ValidationErrors::new();

    if !is_plain_id(&event.event_id) {
        errors.add_error("event_id", "Invalid event id", Some(&event.event_id));
    }
    if !is_plain_id(&event.update_id) {
        errors.add_error("update_id", "Invalid update id", Some(&event.update_id));
    }
    match sanitize_contract_id(&event.contract_id) {
        Some(id) => event.contract_id = id,
        None => errors.add_error("contract_id", "Invalid contract id", Some(&event.contract_id)),
    }
    match sanitize_template_id(&event.template_id) {
        Some(id) => event.template_id = id,
        None => errors.add_error("template_id", "Invalid template id", Some(&event.template_id)),
    }
    for party in event.signatories.iter().chain(event.observers.iter()) {
        if sanitize_party_id(party).is_none() {
            errors.add_error("parties", "Invalid party id", Some(party));
        }
    }
    match (&event.event_type, event.choice.as_deref()) {
        (EventType::Exercised, None) => {
            errors.add_error("choice", "Exercised events need a choice", None);
        }
        (_, Some(choice)) if !is_choice_name(choice) => {
            errors.add_error("choice", "Invalid choice name", Some(choice));
        }
        _ => {}
    }
    if event.event_type == EventType::Exercised && event.choice.as_deref() == Some("Archive") {
        event.consuming = true;
    }

    if errors.is_empty() {
        Ok(event)
    } else {
        Err(errors)
    }
}
