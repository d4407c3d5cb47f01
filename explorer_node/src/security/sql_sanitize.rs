//! SQL input sanitization for the ledger query API
//!
//! Denylist detection of injection payloads, escaping for literal and LIKE
//! interpolation, and allowlist/bounds validation of structured fields.
//! Escaping follows standard SQL string rules (SQLite/DuckDB): a quote is
//! doubled, backslash only has meaning inside `LIKE ... ESCAPE '\'`.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::EventType;

/// Longest search text kept after trimming (in chars)
pub const MAX_SEARCH_LEN: usize = 200;
pub const MAX_TEMPLATE_ID_LEN: usize = 256;

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;
pub const MAX_OFFSET: i64 = 1_000_000;

/// Category of a detected injection payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionKind {
    /// `;` followed by another statement keyword
    StackedStatement,
    /// statement terminator or closing quote followed by a comment marker
    TerminatedComment,
    UnionSelect,
    /// always-true / always-false boolean comparisons
    Tautology,
    /// file or extension I/O (`INTO OUTFILE`, `read_csv(`, `ATTACH '...'`)
    FileAccess,
    /// engine-specific stored procedures and dynamic execution
    ProcedureCall,
    TimeDelay,
}

impl InjectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionKind::StackedStatement => "stacked_statement",
            InjectionKind::TerminatedComment => "terminated_comment",
            InjectionKind::UnionSelect => "union_select",
            InjectionKind::Tautology => "tautology",
            InjectionKind::FileAccess => "file_access",
            InjectionKind::ProcedureCall => "procedure_call",
            InjectionKind::TimeDelay => "time_delay",
        }
    }
}

impl fmt::Display for InjectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result ordering accepted by list endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

const STATEMENT_KEYWORDS: &str = "select|insert|update|delete|drop|alter|create|truncate|attach|detach|copy|pragma|install|load|exec|execute|grant|revoke|merge|replace|call|set";

// Checked in order; the first hit decides the reported kind.
static DENYLIST: Lazy<Vec<(InjectionKind, Regex)>> = Lazy::new(|| {
    let stacked = format!(r";\s*({})\b", STATEMENT_KEYWORDS);
    let table: Vec<(InjectionKind, String)> = vec![
        (InjectionKind::StackedStatement, stacked),
        (InjectionKind::TerminatedComment, r"(;|')\s*(--|#|/\*)".to_string()),
        (
            InjectionKind::UnionSelect,
            r"\bunion\b(\s+(all|distinct))?(\s+|\s*\()select\b".to_string(),
        ),
        (
            InjectionKind::Tautology,
            r"\b(or|and)\s+'?\d+'?\s*(=|<>|!=|<=|>=|<|>)\s*'?\d+'?".to_string(),
        ),
        (
            InjectionKind::Tautology,
            r"'\s*(or|and)\s+'[^']*'\s*(=|<>|!=|like)\s*'".to_string(),
        ),
        (InjectionKind::Tautology, r"'\s*or\s+(true|not\s+false)\b".to_string()),
        (InjectionKind::FileAccess, r"\binto\s+(out|dump)file\b".to_string()),
        (InjectionKind::FileAccess, r"\bload_file\s*\(".to_string()),
        (InjectionKind::FileAccess, r"\bload\s+data\b".to_string()),
        (InjectionKind::FileAccess, r"\bcopy\b.*\b(to|from)\s+'".to_string()),
        (
            InjectionKind::FileAccess,
            r"\b(read_csv_auto|read_csv|read_parquet|parquet_scan|read_json_auto|read_json|read_text|read_blob|glob)\s*\("
                .to_string(),
        ),
        (InjectionKind::FileAccess, r"\battach\s+(database\s+)?'".to_string()),
        (InjectionKind::FileAccess, r"\b(force\s+)?install\s+\w+\s*(from\b|;)".to_string()),
        (InjectionKind::FileAccess, r"\bload\s+('[^']*'|\w+\s*;)".to_string()),
        (
            InjectionKind::ProcedureCall,
            r"\b(xp_cmdshell|xp_regread|sp_executesql|sp_oacreate|sp_configure)\b".to_string(),
        ),
        (
            InjectionKind::ProcedureCall,
            r"\bexec(ute)?\s*(\(|\s+(sp_|xp_|master\.|immediate\b))".to_string(),
        ),
        (InjectionKind::ProcedureCall, r"\bdbms_\w+\.".to_string()),
        (InjectionKind::ProcedureCall, r"\butl_(http|file)\b".to_string()),
        (InjectionKind::TimeDelay, r"\b(pg_sleep|sleep|benchmark)\s*\(".to_string()),
        (InjectionKind::TimeDelay, r"\bwaitfor\s+delay\b".to_string()),
    ];

    table
        .into_iter()
        .filter_map(|(kind, pattern)| {
            match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                Ok(re) => Some((kind, re)),
                Err(e) => {
                    log::error!("Invalid denylist pattern {}: {}", pattern, e);
                    None
                }
            }
        })
        .collect()
});

static DATE_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static regex"));

static RFC3339: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}[Tt]\d{2}:\d{2}:\d{2}(\.\d{1,9})?([Zz]|[+-]\d{2}:\d{2})$")
        .expect("static regex")
});

static CONTRACT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{2,512}$").expect("static regex"));

static TEMPLATE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#?[A-Za-z0-9_.\-]+(:[A-Za-z0-9_.\-]+){0,2}$").expect("static regex")
});

static PARTY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_.\-]{1,128}(::[0-9a-fA-F]{1,128})?$").expect("static regex")
});

static INLINE_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("static regex"));

/// Classify `input` against the injection denylist.
///
/// Each pattern is tried on the raw input and on a copy where closed
/// `/* ... */` comments count as whitespace.
pub fn detect_injection(input: &str) -> Option<InjectionKind> {
    let decommented = INLINE_COMMENT.replace_all(input, " ");
    DENYLIST
        .iter()
        .find(|(_, re)| re.is_match(input) || re.is_match(&decommented))
        .map(|(kind, _)| *kind)
}

pub fn contains_sql_injection(input: &str) -> bool {
    detect_injection(input).is_some()
}

/// Escape a value for interpolation inside a single-quoted SQL literal
pub fn escape_sql_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 2);
    for c in input.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\0' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Escaped value wrapped in single quotes
pub fn quote_literal(input: &str) -> String {
    format!("'{}'", escape_sql_string(input))
}

/// Escape LIKE wildcards so the value only matches itself.
/// Pair with `ESCAPE '\'` in the query.
pub fn escape_like_pattern(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    for c in input.chars() {
        match c {
            '\\' | '%' | '_' => {
                out.push('\\');
                out.push(c);
            }
            '\0' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Parse an integer field; unparsable or missing input yields `default`,
/// parsed values are clamped into `[min, max]`.
pub fn sanitize_int(raw: Option<&str>, default: i64, min: i64, max: i64) -> i64 {
    let value = match raw.map(str::trim).and_then(|s| s.parse::<i64>().ok()) {
        Some(v) => v,
        None => return default,
    };
    value.max(min).min(max)
}

pub fn sanitize_limit(raw: Option<&str>) -> i64 {
    sanitize_int(raw, DEFAULT_LIMIT, 1, MAX_LIMIT)
}

pub fn sanitize_offset(raw: Option<&str>) -> i64 {
    sanitize_int(raw, 0, 0, MAX_OFFSET)
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DD` (midnight UTC)
pub fn sanitize_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let parsed = if DATE_ONLY.is_match(raw) {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?
            .and_utc()
    } else if RFC3339.is_match(raw) {
        DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc)
    } else {
        return None;
    };

    if (2000..=2100).contains(&parsed.year()) {
        Some(parsed)
    } else {
        None
    }
}

/// Lower-cased hex contract id, `0x` prefix tolerated
pub fn sanitize_contract_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let hex = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw)
        .to_ascii_lowercase();
    CONTRACT_ID.is_match(&hex).then_some(hex)
}

/// `[#]package[:Module.Path[:Entity]]`
pub fn sanitize_template_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.len() > MAX_TEMPLATE_ID_LEN {
        return None;
    }
    TEMPLATE_ID.is_match(raw).then(|| raw.to_string())
}

/// `hint::fingerprint` or a bare party hint
pub fn sanitize_party_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    PARTY_ID.is_match(raw).then(|| raw.to_string())
}

pub fn sanitize_event_type(raw: &str) -> Option<EventType> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "created" => Some(EventType::Created),
        "exercised" => Some(EventType::Exercised),
        "archived" => Some(EventType::Archived),
        _ => None,
    }
}

pub fn sanitize_sort_order(raw: Option<&str>) -> SortOrder {
    match raw.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref s) if s == "asc" => SortOrder::Asc,
        _ => SortOrder::Desc,
    }
}

/// Free-text search term ready for a `LIKE ? ESCAPE '\'` binding.
///
/// Returns an empty string when the input carries an injection pattern or
/// control characters; callers treat empty as "no search".
pub fn sanitize_search(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
        return String::new();
    }
    if let Some(kind) = detect_injection(trimmed) {
        log::warn!("Rejected search input ({})", kind);
        return String::new();
    }
    let truncated: String = trimmed.chars().take(MAX_SEARCH_LEN).collect();
    escape_like_pattern(&truncated)
}

/// Map a caller-supplied column name onto an allowlisted one
pub fn sanitize_column(
    raw: Option<&str>,
    allowed: &[&'static str],
    default: &'static str,
) -> &'static str {
    raw.map(str::trim)
        .and_then(|name| allowed.iter().copied().find(|c| c.eq_ignore_ascii_case(name)))
        .unwrap_or(default)
}
