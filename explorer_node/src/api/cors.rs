/// CORS configuration for the explorer API
/// Origins are matched exactly, by `*.domain` wildcard, or `*` for any

use axum::http::{header, HeaderName, HeaderValue, Method};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub max_age: Duration,
}

impl CorsConfig {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        CorsConfig {
            allowed_origins,
            max_age: Duration::from_secs(3600),
        }
    }

    /// Check if origin is allowed
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| {
            if allowed == "*" || allowed == origin {
                return true;
            }
            // "https://*.example.org" allows any subdomain over the same scheme
            match allowed.split_once("*.") {
                Some((scheme, domain)) => origin
                    .strip_prefix(scheme)
                    .and_then(|host| host.strip_suffix(domain))
                    .is_some_and(|sub| sub.ends_with('.') && sub.len() > 1),
                None => false,
            }
        })
    }

    pub fn layer(&self) -> CorsLayer {
        let config = self.clone();
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
                origin
                    .to_str()
                    .map(|o| config.is_origin_allowed(o))
                    .unwrap_or(false)
            }))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                header::ACCEPT,
                HeaderName::from_static("x-api-key"),
            ])
            .expose_headers([header::RETRY_AFTER])
            .max_age(self.max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let cors = CorsConfig::new(vec![
            "http://localhost:5173".to_string(),
            "https://*.canton.network".to_string(),
        ]);
        assert!(cors.is_origin_allowed("http://localhost:5173"));
        assert!(cors.is_origin_allowed("https://explorer.canton.network"));
        assert!(!cors.is_origin_allowed("https://canton.network"));
        assert!(!cors.is_origin_allowed("https://evilcanton.network"));
        assert!(!cors.is_origin_allowed("http://explorer.canton.network"));
        assert!(!cors.is_origin_allowed("http://localhost:3000"));
    }

    #[test]
    fn test_any_origin() {
        let cors = CorsConfig::new(vec!["*".to_string()]);
        assert!(cors.is_origin_allowed("https://anything.example"));
        assert!(!CorsConfig::new(vec![]).is_origin_allowed("https://anything.example"));
    }
}
