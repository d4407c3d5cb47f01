//! Security Module
//! Input sanitization, authentication, rate limiting, server protection and crash logging

pub mod auth;
pub mod crash_log;
pub mod rate_limiter;
pub mod server_protection;
pub mod sql_sanitize;

// Re-export main types
pub use auth::{auth_middleware, require_admin, AuthError, Authenticator, Caller, Claims, Role};
pub use crash_log::{install_panic_hook, CrashKind, CrashLogger, CrashReport};
pub use rate_limiter::{LimitKind, RateLimitConfig, RateLimitError, RateLimitStatus, RateLimiter};
pub use server_protection::{MemoryGuard, ProtectionConfig, ProtectionState};
pub use sql_sanitize::{detect_injection, InjectionKind, SortOrder};
