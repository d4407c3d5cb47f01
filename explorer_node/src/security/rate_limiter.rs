/// Rate limiting for the explorer API
/// Fixed windows per client address, per authenticated subject, and global

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_ip_per_second: u32,
    pub per_ip_per_minute: u32,
    pub per_ip_per_hour: u32,
    pub per_subject_per_second: u32,
    pub per_subject_per_hour: u32,
    pub global_per_second: u32,
    /// Extra requests tolerated on top of `per_ip_per_second`
    pub burst_allowance: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            per_ip_per_second: 10,
            per_ip_per_minute: 300,
            per_ip_per_hour: 3000,
            per_subject_per_second: 5,
            per_subject_per_hour: 1000,
            global_per_second: 1000,
            burst_allowance: 20,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    start: Instant,
}

impl Window {
    fn new(now: Instant) -> Self {
        Window { count: 0, start: now }
    }

    /// Start a fresh window once `len` has elapsed
    fn roll(&mut self, now: Instant, len: Duration) {
        if now.duration_since(self.start) >= len {
            self.count = 0;
            self.start = now;
        }
    }

    fn retry_after(&self, now: Instant, len: Duration) -> u64 {
        let remaining = len.saturating_sub(now.duration_since(self.start));
        remaining.as_secs_f64().ceil().max(1.0) as u64
    }
}

#[derive(Clone, Copy)]
struct RateLimitEntry {
    second: Window,
    minute: Window,
    hour: Window,
    last_request: Instant,
}

impl RateLimitEntry {
    fn new(now: Instant) -> Self {
        RateLimitEntry {
            second: Window::new(now),
            minute: Window::new(now),
            hour: Window::new(now),
            last_request: now,
        }
    }

    fn roll(&mut self, now: Instant) {
        self.second.roll(now, SECOND);
        self.minute.roll(now, MINUTE);
        self.hour.roll(now, HOUR);
    }

    fn increment(&mut self, now: Instant) {
        self.second.count += 1;
        self.minute.count += 1;
        self.hour.count += 1;
        self.last_request = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Global,
    IpPerSecond,
    IpPerMinute,
    IpPerHour,
    SubjectPerSecond,
    SubjectPerHour,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::Global => write!(f, "Global"),
            LimitKind::IpPerSecond => write!(f, "Client (per second)"),
            LimitKind::IpPerMinute => write!(f, "Client (per minute)"),
            LimitKind::IpPerHour => write!(f, "Client (per hour)"),
            LimitKind::SubjectPerSecond => write!(f, "Subject (per second)"),
            LimitKind::SubjectPerHour => write!(f, "Subject (per hour)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} rate limit exceeded, retry after {retry_after}s")]
pub struct RateLimitError {
    pub kind: LimitKind,
    pub retry_after: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub requests_this_second: u32,
    pub requests_this_minute: u32,
    pub requests_this_hour: u32,
    pub limit_per_second: u32,
    pub limit_per_minute: u32,
    pub limit_per_hour: u32,
    pub idle_secs: u64,
}

struct Counters {
    ips: HashMap<String, RateLimitEntry>,
    subjects: HashMap<String, RateLimitEntry>,
    global: Window,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    counters: Mutex<Counters>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            counters: Mutex::new(Counters {
                ips: HashMap::new(),
                subjects: HashMap::new(),
                global: Window::new(Instant::now()),
            }),
        }
    }

    /// Check and count a request. A rejected request is not counted.
    pub fn check_rate_limit(&self, ip: &str, subject: Option<&str>) -> Result<(), RateLimitError> {
        self.check_at(ip, subject, Instant::now())
    }

    fn check_at(&self, ip: &str, subject: Option<&str>, now: Instant) -> Result<(), RateLimitError> {
        let mut counters = self.counters.lock();
        let Counters { ips, subjects, global } = &mut *counters;
        let cfg = &self.config;

        global.roll(now, SECOND);
        if global.count >= cfg.global_per_second {
            return Err(RateLimitError {
                kind: LimitKind::Global,
                retry_after: global.retry_after(now, SECOND),
            });
        }

        let ip_entry = ips
            .entry(ip.to_string())
            .or_insert_with(|| RateLimitEntry::new(now));
        ip_entry.roll(now);
        let ip_checks = [
            (
                &ip_entry.second,
                cfg.per_ip_per_second.saturating_add(cfg.burst_allowance),
                SECOND,
                LimitKind::IpPerSecond,
            ),
            (&ip_entry.minute, cfg.per_ip_per_minute, MINUTE, LimitKind::IpPerMinute),
            (&ip_entry.hour, cfg.per_ip_per_hour, HOUR, LimitKind::IpPerHour),
        ];
        for (window, limit, len, kind) in ip_checks {
            if window.count >= limit {
                return Err(RateLimitError {
                    kind,
                    retry_after: window.retry_after(now, len),
                });
            }
        }

        if let Some(subject) = subject {
            let entry = subjects
                .entry(subject.to_string())
                .or_insert_with(|| RateLimitEntry::new(now));
            entry.roll(now);
            let subject_checks = [
                (&entry.second, cfg.per_subject_per_second, SECOND, LimitKind::SubjectPerSecond),
                (&entry.hour, cfg.per_subject_per_hour, HOUR, LimitKind::SubjectPerHour),
            ];
            for (window, limit, len, kind) in subject_checks {
                if window.count >= limit {
                    return Err(RateLimitError {
                        kind,
                        retry_after: window.retry_after(now, len),
                    });
                }
            }
            entry.increment(now);
        }

        global.count += 1;
        ip_entry.increment(now);
        Ok(())
    }

    /// Drop entries idle for longer than an hour (call periodically)
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&self, now: Instant) -> usize {
        let mut counters = self.counters.lock();
        let before = counters.ips.len() + counters.subjects.len();
        counters
            .ips
            .retain(|_, entry| now.duration_since(entry.last_request) < HOUR);
        counters
            .subjects
            .retain(|_, entry| now.duration_since(entry.last_request) < HOUR);
        before - (counters.ips.len() + counters.subjects.len())
    }

    /// Current counters for a client address
    pub fn ip_status(&self, ip: &str) -> Option<RateLimitStatus> {
        let now = Instant::now();
        let counters = self.counters.lock();
        counters.ips.get(ip).map(|entry| {
            let mut entry_now = *entry;
            entry_now.roll(now);
            RateLimitStatus {
                requests_this_second: entry_now.second.count,
                requests_this_minute: entry_now.minute.count,
                requests_this_hour: entry_now.hour.count,
                limit_per_second: self.config.per_ip_per_second,
                limit_per_minute: self.config.per_ip_per_minute,
                limit_per_hour: self.config.per_ip_per_hour,
                idle_secs: now.duration_since(entry.last_request).as_secs(),
            }
        })
    }

    pub fn tracked_clients(&self) -> usize {
        self.counters.lock().ips.len()
    }
}
