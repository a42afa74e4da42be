use std::sync::Arc;

use crate::config::ServerConfig;
use crate::identity::SessionVerifier;
use crate::security::{KeyedRateLimiter, SecurityConfig};
use crate::store::Store;
use crate::webhook::WebhookVerifier;

/// Shared application state. Built once by the entry point and handed to every
/// handler; there is no other process-wide state.
pub struct AppState {
    /// Storage client handle (memory or Postgres).
    pub store: Store,
    /// Session token verifier for `/api/*`.
    pub sessions: SessionVerifier,
    /// Webhook signature verifier for the identity provider endpoint.
    pub webhook: WebhookVerifier,
    /// Per-IP request rate limiter; None = no limit.
    pub rate_limiter: Option<Arc<KeyedRateLimiter>>,
    pub security: SecurityConfig,
}

impl AppState {
    pub fn new(config: &ServerConfig, store: Store) -> Self {
        Self {
            store,
            sessions: SessionVerifier::new(&config.session_secret),
            webhook: WebhookVerifier::new(&config.webhook_secret),
            rate_limiter: config.security.build_rate_limiter(),
            security: config.security.clone(),
        }
    }
}

pub type SharedState = Arc<AppState>;
