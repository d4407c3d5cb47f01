//! Crash logging
//!
//! Panics and fatal errors are appended to a JSON-lines file so operators
//! can inspect them after a restart.

use chrono::{DateTime, Utc};
use log::{error, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::any::Any;
use std::io::{self, BufRead, BufReader, Write};
use std::panic::{self, Location};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashKind {
    Panic,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: CrashKind,
    pub message: String,
    pub location: Option<String>,
    pub thread: Option<String>,
}

impl CrashReport {
    pub fn new(kind: CrashKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            location: None,
            thread: std::thread::current().name().map(str::to_string),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    fn from_panic(payload: &(dyn Any + Send), location: Option<&Location<'_>>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        let report = CrashReport::new(CrashKind::Panic, message);
        match location {
            Some(loc) => report.with_location(format!("{}:{}:{}", loc.file(), loc.line(), loc.column())),
            None => report,
        }
    }
}

pub struct CrashLogger {
    path: PathBuf,
    // serializes appends from concurrent panics
    write_lock: Mutex<()>,
}

impl CrashLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, report: &CrashReport) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(report)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }

    /// Most recent reports first. Lines that fail to parse are skipped.
    pub fn recent(&self, limit: usize) -> io::Result<Vec<CrashReport>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reports = Vec::new();
        for raw in BufReader::new(file).split(b'\n') {
            let raw = raw?;
            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Skipping crash log line that is not UTF-8: {}", e);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CrashReport>(line) {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Skipping unreadable crash log line: {}", e),
            }
        }
        reports.reverse();
        reports.truncate(limit);
        Ok(reports)
    }
}

/// Record every panic to `logger`, then run the previously installed hook
pub fn install_panic_hook(logger: Arc<CrashLogger>) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let report = CrashReport::from_panic(info.payload(), info.location());
        if let Err(e) = logger.record(&report) {
            error!("Failed to write crash report {}: {}", report.id, e);
        }
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CrashLogger::new(dir.path().join("logs").join("crashes.jsonl"));
        assert!(logger.recent(10).unwrap().is_empty());

        let first = CrashReport::new(CrashKind::Fatal, "database unavailable");
        let second = CrashReport::new(CrashKind::Panic, "index out of bounds").with_location("src/lib.rs:1:1");
        logger.record(&first).unwrap();
        logger.record(&second).unwrap();

        let recent = logger.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], second);
        assert_eq!(recent[1], first);
        assert_eq!(logger.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashes.jsonl");
        let logger = CrashLogger::new(&path);
        logger.record(&CrashReport::new(CrashKind::Fatal, "one")).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json\n\n")
            .unwrap();
        logger.record(&CrashReport::new(CrashKind::Fatal, "two")).unwrap();

        let messages: Vec<_> = logger
            .recent(10)
            .unwrap()
            .into_iter()
            .map(|r| r.message)
            .collect();
        assert_eq!(messages, vec!["two", "one"]);
    }

    #[test]
    fn test_skips_non_utf8_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashes.jsonl");
        let logger = CrashLogger::new(&path);
        logger.record(&CrashReport::new(CrashKind::Fatal, "before")).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"\xff\xfe garbage\n")
            .unwrap();
        logger.record(&CrashReport::new(CrashKind::Panic, "after")).unwrap();

        let recent = logger.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "after");
        assert_eq!(recent[1].message, "before");
    }

    #[test]
    fn test_panic_hook_records_report() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(CrashLogger::new(dir.path().join("crashes.jsonl")));

        let previous_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = previous_ran.clone();
        panic::set_hook(Box::new(move |_| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        install_panic_hook(logger.clone());

        let result = panic::catch_unwind(|| panic!("hook test explosion"));
        let _ = panic::take_hook();

        assert!(result.is_err());
        assert!(previous_ran.load(std::sync::atomic::Ordering::SeqCst));
        let recent = logger.recent(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, CrashKind::Panic);
        assert_eq!(recent[0].message, "hook test explosion");
        let location = recent[0].location.as_deref().unwrap();
        assert!(location.contains("crash_log.rs"), "location {}", location);
    }
}
