//! Security configuration and middleware.
//!
//! All settings are env-driven: CORS, body limit, and optional per-IP rate
//! limiting. Works behind a proxy that sets CF-Connecting-IP / X-Forwarded-For.

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::env;
use std::num::NonZeroU32;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::ApiError;
use crate::state::AppState;

/// Client IP as extracted from CF-Connecting-IP, X-Forwarded-For, or "unknown".
/// Injected into request extensions by client_ip_middleware for use in handlers.
#[derive(Clone, Debug)]
pub struct ClientIp(pub String);

pub type KeyedRateLimiter = DefaultKeyedRateLimiter<String>;

/// Security-related configuration from environment.
/// All limits are optional (0 = disabled).
#[derive(Clone, Debug)]
pub struct SecurityConfig {
    /// Comma-separated allowed CORS origins; unset or "*" = permissive.
    pub cors_origins: Option<String>,
    /// Max JSON/body size in bytes for REST.
    pub max_body_bytes: usize,
    /// Requests per minute per client IP; 0 = unlimited.
    pub rate_limit_per_min: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cors_origins: None,
            max_body_bytes: 1_000_000,
            rate_limit_per_min: 0,
        }
    }
}

impl SecurityConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_body_bytes = env::var("TALKTIME_MAX_BODY_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_body_bytes);

        let rate_limit_per_min = env::var("TALKTIME_RATE_LIMIT_PER_MIN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rate_limit_per_min);

        let cors_origins = env::var("TALKTIME_CORS_ORIGINS").ok();

        Self {
            cors_origins,
            max_body_bytes,
            rate_limit_per_min,
        }
    }

    pub fn build_rate_limiter(&self) -> Option<Arc<KeyedRateLimiter>> {
        let per_min = NonZeroU32::new(self.rate_limit_per_min)?;
        Some(Arc::new(RateLimiter::keyed(Quota::per_minute(per_min))))
    }
}

/// Build CORS layer from config. Unset or "*" => permissive; otherwise comma-separated origins.
pub fn build_cors_layer(config: &SecurityConfig) -> CorsLayer {
    let origins = config
        .cors_origins
        .as_deref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && *s != "*");

    match origins {
        None => CorsLayer::permissive(),
        Some(list) => {
            let list: Vec<HeaderValue> = list
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .filter_map(|s| HeaderValue::try_from(s.to_string()).ok())
                .collect();
            if list.is_empty() {
                CorsLayer::permissive()
            } else {
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(list))
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any)
            }
        }
    }
}

fn client_ip_from(request: &Request) -> String {
    request
        .headers()
        .get("cf-connecting-ip")
        .or_else(|| request.headers().get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware that extracts client IP and inserts it into request extensions.
/// Run this before handlers or middleware that need ClientIp.
pub async fn client_ip_middleware(mut request: Request, next: Next) -> Response {
    let ip = client_ip_from(&request);
    request.extensions_mut().insert(ClientIp(ip));
    next.run(request).await
}

/// Per-IP request quota. No-op when the limiter is disabled.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(ref limiter) = state.rate_limiter {
        let ip = request
            .extensions()
            .get::<ClientIp>()
            .map(|c| c.0.clone())
            .unwrap_or_else(|| client_ip_from(&request));
        if limiter.check_key(&ip).is_err() {
            log::warn!("Rate limit exceeded for {}", ip);
            return ApiError::RateLimited.into_response();
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_disables_limiter() {
        let config = SecurityConfig::default();
        assert!(config.build_rate_limiter().is_none());
    }

    #[test]
    fn limiter_rejects_after_quota() {
        let config = SecurityConfig {
            rate_limit_per_min: 2,
            ..SecurityConfig::default()
        };
        let limiter = config.build_rate_limiter().unwrap();
        let ip = "10.0.0.1".to_string();
        assert!(limiter.check_key(&ip).is_ok());
        assert!(limiter.check_key(&ip).is_ok());
        assert!(limiter.check_key(&ip).is_err());
        assert!(limiter.check_key(&"10.0.0.2".to_string()).is_ok());
    }
}
