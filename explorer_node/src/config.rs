//! Explorer configuration
//!
//! Layered in order: built-in defaults, an optional TOML file, then
//! `EXPLORER__<SECTION>__<KEY>` environment variables.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::security::rate_limiter::RateLimitConfig;
use crate::security::server_protection::ProtectionConfig;
use crate::security::sql_sanitize::sanitize_template_id;

const MIN_JWT_SECRET_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Allowed browser origins; `*.domain` wildcards and `*` are accepted
    pub cors_origins: Vec<String>,
    /// Take the client address from `X-Forwarded-For`
    pub trust_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec!["http://localhost:5173".to_string()],
            trust_proxy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/ledger.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret; bearer tokens are refused without one
    pub jwt_secret: Option<String>,
    /// Hex SHA-256 digests of accepted API keys
    pub api_key_digests: Vec<String>,
    pub require_auth_for_reads: bool,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            api_key_digests: Vec::new(),
            require_auth_for_reads: false,
            token_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Number of super validators voting on proposals
    pub sv_count: usize,
    pub vote_request_template: String,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            sv_count: 13,
            vote_request_template: "Splice.DsoRules:VoteRequest".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashLogConfig {
    pub path: PathBuf,
}

impl Default for CrashLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/crashes.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub protection: ProtectionConfig,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub governance: GovernanceConfig,
    pub crash_log: CrashLogConfig,
}

impl ExplorerConfig {
    /// Load and validate configuration. A given `path` must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("EXPLORER")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .with_list_parse_key("auth.api_key_digests"),
        );

        let config: ExplorerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.server.port == 0 {
            return invalid("server.port must be non-zero");
        }
        if self.listen_addr().is_err() {
            return invalid("server.bind must be an IP address");
        }
        if self.protection.request_timeout_secs == 0 {
            return invalid("protection.request_timeout_secs must be non-zero");
        }
        if self.protection.max_body_bytes == 0 || self.protection.max_concurrent_requests == 0 {
            return invalid("protection limits must be non-zero");
        }
        if self.protection.memory_poll_secs == 0 || self.protection.rate_limit_cleanup_secs == 0 {
            return invalid("protection intervals must be non-zero");
        }

        let rl = &self.rate_limit;
        let limits = [
            rl.per_ip_per_second,
            rl.per_ip_per_minute,
            rl.per_ip_per_hour,
            rl.per_subject_per_second,
            rl.per_subject_per_hour,
            rl.global_per_second,
        ];
        if limits.contains(&0) {
            return invalid("rate limits must be non-zero");
        }

        if let Some(secret) = &self.auth.jwt_secret {
            if secret.len() < MIN_JWT_SECRET_LEN {
                return Err(ConfigError::Invalid(format!(
                    "auth.jwt_secret must be at least {} bytes",
                    MIN_JWT_SECRET_LEN
                )));
            }
        }
        for digest in &self.auth.api_key_digests {
            let digest = digest.trim();
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return invalid("auth.api_key_digests entries must be hex SHA-256 digests");
            }
        }

        if self.governance.sv_count == 0 {
            return invalid("governance.sv_count must be non-zero");
        }
        if sanitize_template_id(&self.governance.vote_request_template).is_none() {
            return invalid("governance.vote_request_template is not a template id");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.bind, self.server.port)
            .parse::<SocketAddr>()
            .or_else(|_| format!("[{}]:{}", self.server.bind, self.server.port).parse::<SocketAddr>())
            .map_err(|e| ConfigError::Invalid(format!("server.bind: {}", e)))
    }
}
