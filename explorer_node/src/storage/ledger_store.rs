//! SQLite-backed ledger event store
//!
//! All caller values are bound parameters. Text matching uses LIKE with
//! patterns escaped by the sanitizer and `ESCAPE '\'`.

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::events::{storage_timestamp, EVENT_SORT_COLUMNS};
use super::{AcsFilter, EventFilter, EventType, LedgerEvent, Result, StorageError, TemplateStats};
use crate::security::sql_sanitize::{escape_like_pattern, sanitize_column};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    update_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    contract_id TEXT NOT NULL,
    template_id TEXT NOT NULL,
    choice TEXT,
    consuming INTEGER NOT NULL DEFAULT 0,
    signatories TEXT NOT NULL,
    observers TEXT NOT NULL,
    payload TEXT NOT NULL,
    effective_at TEXT NOT NULL,
    record_time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_contract ON events(contract_id);
CREATE INDEX IF NOT EXISTS idx_events_template ON events(template_id);
CREATE INDEX IF NOT EXISTS idx_events_record_time ON events(record_time);
";

const EVENT_COLUMNS: &str = "event_id, update_id, event_type, contract_id, template_id, choice, consuming, signatories, observers, payload, effective_at, record_time";

const ARCHIVAL_CONDITION: &str =
    "(event_type = 'archived' OR (event_type = 'exercised' AND consuming = 1))";

/// Ids bound per `IN (...)` lookup
const ARCHIVED_LOOKUP_CHUNK: usize = 500;

pub struct LedgerStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let p = path.as_ref().to_path_buf();
        if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::InvalidData(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(&p)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened ledger store at {}", p.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(p),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert events in one transaction, skipping ids already stored.
    /// Returns how many rows were new.
    pub fn insert_events(&self, events: &[LedgerEvent]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO events (event_id, update_id, event_type, contract_id, template_id, choice, consuming, signatories, observers, payload, effective_at, record_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for ev in events {
                inserted += stmt.execute(params![
                    ev.event_id,
                    ev.update_id,
                    ev.event_type.as_str(),
                    ev.contract_id,
                    ev.template_id,
                    ev.choice,
                    ev.consuming,
                    serde_json::to_string(&ev.signatories)?,
                    serde_json::to_string(&ev.observers)?,
                    serde_json::to_string(&ev.payload)?,
                    storage_timestamp(&ev.effective_at),
                    storage_timestamp(&ev.record_time),
                ])?;
            }
        }
        tx.commit()?;
        debug!("Inserted {} of {} events", inserted, events.len());
        Ok(inserted)
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<LedgerEvent>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM events WHERE event_id = ?1", EVENT_COLUMNS),
                params![event_id],
                RawEvent::from_row,
            )
            .optional()?;
        raw.map(RawEvent::into_event).transpose()
    }

    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>> {
        let (where_sql, mut args) = event_where_clause(filter);
        let column = sanitize_column(
            Some(filter.sort_column),
            &EVENT_SORT_COLUMNS,
            EVENT_SORT_COLUMNS[0],
        );
        let sql = format!(
            "SELECT {} FROM events{} ORDER BY {} {}, event_id {} LIMIT ? OFFSET ?",
            EVENT_COLUMNS,
            where_sql,
            column,
            filter.order.as_sql(),
            filter.order.as_sql(),
        );
        args.push(Value::Integer(filter.limit));
        args.push(Value::Integer(filter.offset));
        self.collect_events(&sql, args)
    }

    pub fn count_events(&self, filter: &EventFilter) -> Result<u64> {
        let (where_sql, args) = event_where_clause(filter);
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM events{}", where_sql),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Every event for one contract, oldest first
    pub fn contract_history(&self, contract_id: &str) -> Result<Vec<LedgerEvent>> {
        let sql = format!(
            "SELECT {} FROM events WHERE contract_id = ? ORDER BY record_time ASC, event_id ASC",
            EVENT_COLUMNS
        );
        self.collect_events(&sql, vec![Value::Text(contract_id.to_string())])
    }

    /// Created events with no archival at or before `as_of`
    pub fn active_contracts(&self, filter: &AcsFilter) -> Result<Vec<LedgerEvent>> {
        let mut sql = format!(
            "SELECT {} FROM events c WHERE c.event_type = 'created'",
            prefixed_columns("c")
        );
        let mut args = Vec::new();

        if let Some(as_of) = &filter.as_of {
            sql.push_str(" AND c.record_time <= ?");
            args.push(Value::Text(storage_timestamp(as_of)));
        }
        if let Some(template) = &filter.template_id {
            sql.push_str(" AND (c.template_id = ? OR c.template_id LIKE ? ESCAPE '\\')");
            args.push(Value::Text(template.clone()));
            args.push(Value::Text(template_suffix_pattern(template)));
        }

        sql.push_str(" AND NOT EXISTS (SELECT 1 FROM events x WHERE x.contract_id = c.contract_id AND (x.event_type = 'archived' OR (x.event_type = 'exercised' AND x.consuming = 1))");
        if let Some(as_of) = &filter.as_of {
            sql.push_str(" AND x.record_time <= ?");
            args.push(Value::Text(storage_timestamp(as_of)));
        }
        sql.push_str(") ORDER BY c.record_time DESC, c.event_id DESC LIMIT ? OFFSET ?");
        args.push(Value::Integer(filter.limit));
        args.push(Value::Integer(filter.offset));

        self.collect_events(&sql, args)
    }

    pub fn template_stats(&self) -> Result<Vec<TemplateStats>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT template_id,
                    COUNT(DISTINCT CASE WHEN event_type = 'created' THEN contract_id END),
                    SUM(CASE WHEN event_type = 'exercised' THEN 1 ELSE 0 END),
                    COUNT(DISTINCT CASE WHEN {} THEN contract_id END)
             FROM events GROUP BY template_id ORDER BY 2 DESC, template_id ASC",
            ARCHIVAL_CONDITION
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let created: i64 = row.get(1)?;
            let exercised: i64 = row.get(2)?;
            let archived: i64 = row.get(3)?;
            Ok(TemplateStats {
                template_id: row.get(0)?,
                created: created.max(0) as u64,
                exercised: exercised.max(0) as u64,
                archived: archived.max(0) as u64,
                active: created.saturating_sub(archived).max(0) as u64,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::from)
    }

    /// Contract ids (from `ids`) that have an archival event
    pub fn archived_among(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut archived = Vec::new();
        // Stay well below SQLite's host parameter limit
        for chunk in ids.chunks(ARCHIVED_LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT DISTINCT contract_id FROM events WHERE {} AND contract_id IN ({})",
                ARCHIVAL_CONDITION, placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
            for id in rows {
                archived.push(id?);
            }
        }
        archived.sort();
        archived.dedup();
        Ok(archived)
    }

    pub fn latest_record_time(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let latest: Option<String> =
            conn.query_row("SELECT MAX(record_time) FROM events", [], |row| row.get(0))?;
        latest.map(|s| parse_timestamp(&s)).transpose()
    }

    pub fn event_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn collect_events(&self, sql: &str, args: Vec<Value>) -> Result<Vec<LedgerEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), RawEvent::from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_event()?);
        }
        Ok(out)
    }
}

fn prefixed_columns(alias: &str) -> String {
    EVENT_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Matches a party inside a JSON string array column.
///
/// A full id (`hint::fingerprint`) must match a whole element. A bare hint
/// matches any party with that hint.
fn party_pattern(party: &str) -> String {
    if party.contains("::") {
        format!("%\"{}\"%", escape_like_pattern(party))
    } else {
        format!("%\"{}::%", escape_like_pattern(party))
    }
}

/// Matches a template id given without its package prefix
fn template_suffix_pattern(template: &str) -> String {
    format!("%:{}", escape_like_pattern(template))
}

fn event_where_clause(filter: &EventFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args = Vec::new();

    if let Some(event_type) = filter.event_type {
        clauses.push("event_type = ?");
        args.push(Value::Text(event_type.as_str().to_string()));
    }
    if let Some(template) = &filter.template_id {
        clauses.push("(template_id = ? OR template_id LIKE ? ESCAPE '\\')");
        args.push(Value::Text(template.clone()));
        args.push(Value::Text(template_suffix_pattern(template)));
    }
    if let Some(contract_id) = &filter.contract_id {
        clauses.push("contract_id = ?");
        args.push(Value::Text(contract_id.clone()));
    }
    if let Some(party) = &filter.party {
        clauses.push("(signatories LIKE ? ESCAPE '\\' OR observers LIKE ? ESCAPE '\\')");
        let pattern = party_pattern(party);
        args.push(Value::Text(pattern.clone()));
        args.push(Value::Text(pattern));
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("(payload LIKE ? ESCAPE '\\' OR template_id LIKE ? ESCAPE '\\' OR choice LIKE ? ESCAPE '\\')");
        let pattern = format!("%{}%", search);
        for _ in 0..3 {
            args.push(Value::Text(pattern.clone()));
        }
    }
    if let Some(from) = &filter.from {
        clauses.push("record_time >= ?");
        args.push(Value::Text(storage_timestamp(from)));
    }
    if let Some(to) = &filter.to {
        clauses.push("record_time <= ?");
        args.push(Value::Text(storage_timestamp(to)));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), args)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("timestamp {}: {}", s, e)))
}

struct RawEvent {
    event_id: String,
    update_id: String,
    event_type: String,
    contract_id: String,
    template_id: String,
    choice: Option<String>,
    consuming: bool,
    signatories: String,
    observers: String,
    payload: String,
    effective_at: String,
    record_time: String,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            update_id: row.get(1)?,
            event_type: row.get(2)?,
            contract_id: row.get(3)?,
            template_id: row.get(4)?,
            choice: row.get(5)?,
            consuming: row.get(6)?,
            signatories: row.get(7)?,
            observers: row.get(8)?,
            payload: row.get(9)?,
            effective_at: row.get(10)?,
            record_time: row.get(11)?,
        })
    }

    fn into_event(self) -> Result<LedgerEvent> {
        let event_type = match self.event_type.as_str() {
            "created" => EventType::Created,
            "exercised" => EventType::Exercised,
            "archived" => EventType::Archived,
            other => {
                return Err(StorageError::InvalidData(format!(
                    "unknown event type {} for {}",
                    other, self.event_id
                )))
            }
        };
        Ok(LedgerEvent {
            event_type,
            update_id: self.update_id,
            contract_id: self.contract_id,
            template_id: self.template_id,
            choice: self.choice,
            consuming: self.consuming,
            signatories: serde_json::from_str(&self.signatories)?,
            observers: serde_json::from_str(&self.observers)?,
            payload: serde_json::from_str(&self.payload)?,
            effective_at: parse_timestamp(&self.effective_at)?,
            record_time: parse_timestamp(&self.record_time)?,
            event_id: self.event_id,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_717_200_000 + secs, 0).unwrap()
    }

    pub(crate) fn event(
        id: &str,
        event_type: EventType,
        contract: &str,
        template: &str,
        secs: i64,
    ) -> LedgerEvent {
        LedgerEvent {
            event_id: id.to_string(),
            update_id: format!("upd-{}", id),
            event_type,
            contract_id: contract.to_string(),
            template_id: template.to_string(),
            choice: None,
            consuming: false,
            signatories: vec!["dso::1220aa".to_string()],
            observers: vec![],
            payload: json!({ "note": format!("event {}", id) }),
            effective_at: ts(secs),
            record_time: ts(secs),
        }
    }

    const AMULET: &str = "pkg1:Splice.Amulet:Amulet";
    const RULES: &str = "pkg1:Splice.DsoRules:DsoRules";

    fn seeded() -> LedgerStore {
        let store = LedgerStore::open_in_memory().unwrap();
        let mut consume = event("e4", EventType::Exercised, "00c2", AMULET, 40);
        consume.choice = Some("Amulet_Transfer".to_string());
        consume.consuming = true;
        let events = vec![
            event("e1", EventType::Created, "00c1", AMULET, 10),
            event("e2", EventType::Created, "00c2", AMULET, 20),
            event("e3", EventType::Created, "00c3", RULES, 30),
            consume,
            event("e5", EventType::Archived, "00c3", RULES, 50),
        ];
        assert_eq!(store.insert_events(&events).unwrap(), 5);
        store
    }

    #[test]
    fn test_insert_is_idempotent() {
        let store = seeded();
        let again = vec![event("e1", EventType::Created, "00c1", AMULET, 10)];
        assert_eq!(store.insert_events(&again).unwrap(), 0);
        assert_eq!(store.event_count().unwrap(), 5);
    }

    #[test]
    fn test_get_event_roundtrip() {
        let store = seeded();
        let ev = store.get_event("e4").unwrap().unwrap();
        assert_eq!(ev.choice.as_deref(), Some("Amulet_Transfer"));
        assert!(ev.consuming);
        assert_eq!(ev.record_time, ts(40));
        assert!(store.get_event("missing").unwrap().is_none());
    }

    #[test]
    fn test_query_filters() {
        let store = seeded();

        let filter = EventFilter {
            event_type: Some(EventType::Created),
            ..Default::default()
        };
        let created = store.query_events(&filter).unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(created[0].event_id, "e3");

        let filter = EventFilter {
            template_id: Some("Splice.Amulet:Amulet".to_string()),
            order: crate::security::sql_sanitize::SortOrder::Asc,
            ..Default::default()
        };
        let amulets = store.query_events(&filter).unwrap();
        assert_eq!(
            amulets.iter().map(|e| e.event_id.as_str()).collect::<Vec<_>>(),
            vec!["e1", "e2", "e4"]
        );
        assert_eq!(store.count_events(&filter).unwrap(), 3);

        let filter = EventFilter {
            from: Some(ts(20)),
            to: Some(ts(40)),
            ..Default::default()
        };
        assert_eq!(store.count_events(&filter).unwrap(), 3);

        let filter = EventFilter {
            party: Some("dso::1220aa".to_string()),
            limit: 2,
            ..Default::default()
        };
        assert_eq!(store.query_events(&filter).unwrap().len(), 2);
    }

    #[test]
    fn test_search_treats_wildcards_literally() {
        let store = seeded();
        let filter = EventFilter {
            search: Some(escape_like_pattern("event e3")),
            ..Default::default()
        };
        assert_eq!(store.query_events(&filter).unwrap().len(), 1);

        let filter = EventFilter {
            search: Some(escape_like_pattern("%")),
            ..Default::default()
        };
        assert!(store.query_events(&filter).unwrap().is_empty());
    }

    #[test]
    fn test_active_contracts() {
        let store = seeded();
        let acs = store.active_contracts(&AcsFilter::default()).unwrap();
        assert_eq!(acs.len(), 1);
        assert_eq!(acs[0].contract_id, "00c1");

        let before_archive = AcsFilter {
            as_of: Some(ts(35)),
            ..Default::default()
        };
        let ids: Vec<_> = store
            .active_contracts(&before_archive)
            .unwrap()
            .into_iter()
            .map(|e| e.contract_id)
            .collect();
        assert_eq!(ids, vec!["00c3", "00c2", "00c1"]);

        let rules_only = AcsFilter {
            as_of: Some(ts(35)),
            template_id: Some(RULES.to_string()),
            ..Default::default()
        };
        assert_eq!(store.active_contracts(&rules_only).unwrap().len(), 1);
    }

    #[test]
    fn test_template_stats() {
        let store = seeded();
        let stats = store.template_stats().unwrap();
        assert_eq!(stats.len(), 2);
        let amulet = stats.iter().find(|s| s.template_id == AMULET).unwrap();
        assert_eq!((amulet.created, amulet.exercised, amulet.archived, amulet.active), (2, 1, 1, 1));
        let rules = stats.iter().find(|s| s.template_id == RULES).unwrap();
        assert_eq!(rules.active, 0);
    }

    #[test]
    fn test_history_and_latest() {
        let store = seeded();
        let history = store.contract_history("00c2").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, EventType::Created);
        assert_eq!(store.latest_record_time().unwrap(), Some(ts(50)));
        assert_eq!(
            store.archived_among(&["00c1".to_string(), "00c3".to_string()]).unwrap(),
            vec!["00c3".to_string()]
        );
    }

    #[test]
    fn test_archived_among_many_ids() {
        let store = seeded();
        // more ids than one IN lookup binds, archived ones in separate chunks
        let mut ids: Vec<String> = (0..40_000).map(|i| format!("{:08x}", i)).collect();
        ids.insert(3, "00c3".to_string());
        ids.push("00c2".to_string());
        ids.push("00c3".to_string());
        assert_eq!(
            store.archived_among(&ids).unwrap(),
            vec!["00c2".to_string(), "00c3".to_string()]
        );
        assert!(store.archived_among(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_party_hint_matches_full_ids() {
        let store = seeded();
        let mut observed = event("e6", EventType::Created, "00c6", AMULET, 60);
        observed.signatories = vec!["validator-1::1220bb".to_string()];
        observed.observers = vec!["dsoish::1220cc".to_string()];
        store.insert_events(&[observed]).unwrap();

        let by_hint = |party: &str| {
            let filter = EventFilter {
                party: Some(party.to_string()),
                ..Default::default()
            };
            store.count_events(&filter).unwrap()
        };
        assert_eq!(by_hint("dso"), 5);
        assert_eq!(by_hint("dso::1220aa"), 5);
        assert_eq!(by_hint("dso::1220"), 0);
        assert_eq!(by_hint("validator-1"), 1);
        assert_eq!(by_hint("dsoish"), 1);
        assert_eq!(by_hint("validator"), 0);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        {
            let store = LedgerStore::open(&path).unwrap();
            store
                .insert_events(&[event("e1", EventType::Created, "00c1", AMULET, 1)])
                .unwrap();
        }
        let reopened = LedgerStore::open(&path).unwrap();
        assert_eq!(reopened.event_count().unwrap(), 1);
        assert_eq!(reopened.path(), Some(path.as_path()));
    }
}
