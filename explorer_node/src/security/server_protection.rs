//! Server protection stack
//!
//! Wraps the API router in, from the outside in: panic capture, request
//! timeout, body size limit, concurrency limit, memory-pressure shedding,
//! rate limiting and CORS.

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{
    catch_panic::CatchPanicLayer, cors::CorsLayer, limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
};

use super::auth::Authenticator;
use super::rate_limiter::RateLimiter;
use crate::api::errors::ApiError;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Paths that stay reachable while memory is under pressure
const EXEMPT_PATHS: [&str; 1] = ["/health"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub max_concurrent_requests: usize,
    /// Resident memory above which new requests are shed; `None` disables
    pub memory_limit_mb: Option<u64>,
    pub memory_poll_secs: u64,
    pub rate_limit_cleanup_secs: u64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_body_bytes: 1024 * 1024,
            max_concurrent_requests: 256,
            memory_limit_mb: Some(1536),
            memory_poll_secs: 5,
            rate_limit_cleanup_secs: 300,
        }
    }
}

/// Tracks process memory and flags overload
pub struct MemoryGuard {
    limit_bytes: Option<u64>,
    last_sample: AtomicU64,
    overloaded: AtomicBool,
}

impl MemoryGuard {
    pub fn new(limit_mb: Option<u64>) -> Self {
        Self {
            limit_bytes: limit_mb.map(|mb| mb.saturating_mul(BYTES_PER_MB)),
            last_sample: AtomicU64::new(0),
            overloaded: AtomicBool::new(false),
        }
    }

    /// Store a resident-memory sample and return whether the limit is exceeded
    pub fn record_sample(&self, bytes: u64) -> bool {
        self.last_sample.store(bytes, Ordering::Relaxed);
        let over = self.limit_bytes.is_some_and(|limit| bytes > limit);
        let was = self.overloaded.swap(over, Ordering::AcqRel);
        if over && !was {
            warn!(
                "Memory pressure: {} MB resident exceeds limit of {} MB, shedding requests",
                bytes / BYTES_PER_MB,
                self.limit_mb().unwrap_or_default()
            );
        } else if !over && was {
            info!("Memory back under limit ({} MB resident)", bytes / BYTES_PER_MB);
        }
        over
    }

    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Acquire)
    }

    pub fn last_sample_bytes(&self) -> u64 {
        self.last_sample.load(Ordering::Relaxed)
    }

    pub fn limit_mb(&self) -> Option<u64> {
        self.limit_bytes.map(|b| b / BYTES_PER_MB)
    }

    /// Poll the process RSS every `every` until the runtime shuts down
    pub fn spawn_monitor(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let pid = match sysinfo::get_current_pid() {
                Ok(pid) => pid,
                Err(e) => {
                    error!("Memory monitor disabled, cannot resolve own pid: {}", e);
                    return;
                }
            };
            let mut system = System::new();
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Some(bytes) = sample_process_memory(&mut system, pid) {
                    self.record_sample(bytes);
                }
            }
        })
    }
}

fn sample_process_memory(system: &mut System, pid: Pid) -> Option<u64> {
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    system.process(pid).map(|p| p.memory())
}

/// Shared state for the protection middleware
#[derive(Clone)]
pub struct ProtectionState {
    pub memory: Arc<MemoryGuard>,
    pub rate_limiter: Arc<RateLimiter>,
    pub authenticator: Arc<Authenticator>,
    pub trust_proxy: bool,
}

/// Wrap `router` in the protection stack. `cors` ends up innermost.
pub fn install(router: Router, config: &ProtectionConfig, state: ProtectionState, cors: CorsLayer) -> Router {
    // Layers added later wrap the earlier ones.
    router
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn_with_state(state, memory_guard_middleware))
        .layer(GlobalConcurrencyLimitLayer::new(config.max_concurrent_requests.max(1)))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        .layer(CatchPanicLayer::custom(panic_response))
}

/// Periodically drop idle rate-limit entries
pub fn spawn_maintenance(rate_limiter: Arc<RateLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = rate_limiter.cleanup_expired();
            if removed > 0 {
                debug!("Rate limiter dropped {} idle entries", removed);
            }
        }
    })
}

async fn memory_guard_middleware(
    State(state): State<ProtectionState>,
    request: Request,
    next: Next,
) -> Response {
    if state.memory.is_overloaded() && !EXEMPT_PATHS.contains(&request.uri().path()) {
        return ApiError::with_details(
            503,
            "Server under memory pressure, retry later".to_string(),
            serde_json::json!({
                "memory_mb": state.memory.last_sample_bytes() / BYTES_PER_MB,
                "limit_mb": state.memory.limit_mb(),
            }),
        )
        .into_response();
    }
    next.run(request).await
}

async fn rate_limit_middleware(
    State(state): State<ProtectionState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let client = client_key(request.headers(), peer, state.trust_proxy);
    // invalid credentials are rejected later by the auth layer
    let subject = state
        .authenticator
        .authenticate(request.headers())
        .ok()
        .flatten()
        .map(|caller| caller.subject);

    if let Err(e) = state.rate_limiter.check_rate_limit(&client, subject.as_deref()) {
        debug!("Rate limited {} on {}: {}", client, request.uri().path(), e);
        let mut response = ApiError::from(e).into_response();
        if let Ok(value) = HeaderValue::from_str(&e.retry_after.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
    }
    next.run(request).await
}

/// Identify the client for rate limiting
pub fn client_key(headers: &HeaderMap, peer: Option<String>, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(first_hop) = forwarded {
            return first_hop.to_string();
        }
    }
    peer.unwrap_or_else(|| "unknown".to_string())
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    };
    error!("Request handler panicked: {}", detail);
    ApiError::internal_server_error("Internal server error").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_guard_transitions() {
        let guard = MemoryGuard::new(Some(100));
        assert!(!guard.is_overloaded());
        assert!(!guard.record_sample(50 * BYTES_PER_MB));
        assert!(guard.record_sample(101 * BYTES_PER_MB));
        assert!(guard.is_overloaded());
        assert_eq!(guard.last_sample_bytes(), 101 * BYTES_PER_MB);
        assert!(!guard.record_sample(99 * BYTES_PER_MB));
        assert!(!guard.is_overloaded());
    }

    #[test]
    fn test_memory_guard_without_limit() {
        let guard = MemoryGuard::new(None);
        assert!(!guard.record_sample(u64::MAX));
        assert_eq!(guard.limit_mb(), None);
    }

    #[test]
    fn test_client_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        let peer = Some("10.0.0.1".to_string());

        assert_eq!(client_key(&headers, peer.clone(), true), "203.0.113.7");
        assert_eq!(client_key(&headers, peer.clone(), false), "10.0.0.1");
        assert_eq!(client_key(&HeaderMap::new(), peer, true), "10.0.0.1");
        assert_eq!(client_key(&HeaderMap::new(), None, false), "unknown");
    }

    #[test]
    fn test_sample_own_process() {
        let pid = sysinfo::get_current_pid().unwrap();
        let mut system = System::new();
        let bytes = sample_process_memory(&mut system, pid).unwrap();
        assert!(bytes > 0);
    }
}
