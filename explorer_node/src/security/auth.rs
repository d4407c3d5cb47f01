//! Caller authentication for the explorer API
//!
//! Two credential forms are accepted: an HS256 bearer token, or an
//! `X-API-Key` header whose SHA-256 digest is listed in the configuration.
//! API keys always grant admin.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::api::errors::ApiError;
use crate::config::AuthConfig;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reader" => Some(Role::Reader),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    /// Expiry as seconds since the epoch
    pub exp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Jwt,
    ApiKey,
}

/// Authenticated identity attached to the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Caller {
    pub subject: String,
    pub role: Role,
    pub method: AuthMethod,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Malformed Authorization header")]
    MalformedHeader,
    #[error("Token expired")]
    ExpiredToken,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("Token signing is not configured")]
    MissingSecret,
    #[error("Failed to issue token: {0}")]
    Issue(String),
}

pub struct Authenticator {
    keys: Option<(EncodingKey, DecodingKey)>,
    api_key_digests: HashSet<String>,
    require_auth_for_reads: bool,
    token_ttl_secs: u64,
}

impl Authenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        let keys = config.jwt_secret.as_deref().filter(|s| !s.is_empty()).map(|secret| {
            (
                EncodingKey::from_secret(secret.as_bytes()),
                DecodingKey::from_secret(secret.as_bytes()),
            )
        });
        if keys.is_none() {
            debug!("No JWT secret configured, bearer tokens will be rejected");
        }
        Self {
            keys,
            api_key_digests: config
                .api_key_digests
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .collect(),
            require_auth_for_reads: config.require_auth_for_reads,
            token_ttl_secs: config.token_ttl_secs,
        }
    }

    pub fn requires_auth_for_reads(&self) -> bool {
        self.require_auth_for_reads
    }

    /// Resolve the caller from request headers. No credentials is `Ok(None)`.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Caller>, AuthError> {
        if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
            let raw = value.to_str().map_err(|_| AuthError::MalformedHeader)?;
            let token = parse_bearer_token(Some(raw)).ok_or(AuthError::MalformedHeader)?;
            return self.verify_token(&token).map(Some);
        }
        if let Some(value) = headers.get(API_KEY_HEADER) {
            let key = value.to_str().map_err(|_| AuthError::InvalidApiKey)?;
            return self.verify_api_key(key).map(Some);
        }
        Ok(None)
    }

    pub fn verify_token(&self, token: &str) -> Result<Caller, AuthError> {
        let (_, decoding) = self.keys.as_ref().ok_or(AuthError::MissingSecret)?;
        let data = decode::<Claims>(token, decoding, &Validation::new(Algorithm::HS256)).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        Ok(Caller {
            subject: data.claims.sub,
            role: data.claims.role,
            method: AuthMethod::Jwt,
        })
    }

    pub fn verify_api_key(&self, key: &str) -> Result<Caller, AuthError> {
        let digest = hash_api_key(key.trim());
        if self.api_key_digests.contains(&digest) {
            Ok(Caller {
                // short digest prefix identifies the key in logs and rate limits
                subject: format!("api-key:{}", &digest[..12]),
                role: Role::Admin,
                method: AuthMethod::ApiKey,
            })
        } else {
            Err(AuthError::InvalidApiKey)
        }
    }

    /// Sign a token for `sub`; `ttl_secs` defaults to the configured lifetime
    pub fn issue_token(&self, sub: &str, role: Role, ttl_secs: Option<u64>) -> Result<String, AuthError> {
        let (encoding, _) = self.keys.as_ref().ok_or(AuthError::MissingSecret)?;
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            sub: sub.to_string(),
            role,
            exp: now + ttl_secs.unwrap_or(self.token_ttl_secs),
        };
        encode(&Header::new(Algorithm::HS256), &claims, encoding).map_err(|e| AuthError::Issue(e.to_string()))
    }
}

/// Hex SHA-256 digest of an API key, as stored in configuration
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

pub fn parse_bearer_token(header: Option<&str>) -> Option<String> {
    let token = header?.trim().strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Attach the resolved [`Caller`] to the request. Anonymous requests pass
/// unless reads require authentication.
pub async fn auth_middleware(
    State(auth): State<Arc<Authenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    match auth.authenticate(request.headers()) {
        Ok(Some(caller)) => {
            request.extensions_mut().insert(caller);
        }
        Ok(None) if auth.requires_auth_for_reads() => {
            return ApiError::unauthorized("Authentication required").into_response();
        }
        Ok(None) => {}
        Err(e) => {
            warn!("Rejected credentials on {}: {}", request.uri().path(), e);
            return ApiError::from(e).into_response();
        }
    }
    next.run(request).await
}

/// Only admins pass. Must run inside [`auth_middleware`].
pub async fn require_admin(request: Request, next: Next) -> Response {
    match request.extensions().get::<Caller>() {
        None => ApiError::unauthorized("Authentication required").into_response(),
        Some(caller) if caller.role < Role::Admin => {
            warn!("Caller {} denied admin route {}", caller.subject, request.uri().path());
            ApiError::forbidden("Admin role required").into_response()
        }
        Some(_) => next.run(request).await,
    }
}
