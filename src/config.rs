//! Process configuration, read once from the environment at startup.

use std::env;
use std::net::SocketAddr;

use thiserror::Error;

use crate::security::SecurityConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9001";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("TALKTIME_SESSION_SECRET must be set")]
    MissingSessionSecret,
    #[error("Invalid TALKTIME_BIND_ADDR {0:?}")]
    BindAddr(String),
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Shared secret for session token verification.
    pub session_secret: String,
    /// Webhook signing secret (`whsec_...`). Empty rejects every webhook.
    pub webhook_secret: String,
    /// Postgres URL; only honoured with the `postgres` feature.
    pub db_url: Option<String>,
    pub security: SecurityConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind = env::var("TALKTIME_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind.parse().map_err(|_| ConfigError::BindAddr(bind.clone()))?;

        let session_secret = env::var("TALKTIME_SESSION_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingSessionSecret)?;

        let webhook_secret = env::var("CLERK_WEBHOOK_SECRET").unwrap_or_default();
        if webhook_secret.is_empty() {
            log::warn!("CLERK_WEBHOOK_SECRET not set; webhook deliveries will be rejected.");
        }

        let db_url = env::var("TALKTIME_DB_URL").ok().filter(|s| !s.is_empty());

        Ok(Self {
            bind_addr,
            session_secret,
            webhook_secret,
            db_url,
            security: SecurityConfig::from_env(),
        })
    }

    /// Configuration for tests and local runs: memory store, no rate limit.
    pub fn for_secrets(session_secret: &str, webhook_secret: &str) -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9001))),
            session_secret: session_secret.to_string(),
            webhook_secret: webhook_secret.to_string(),
            db_url: None,
            security: SecurityConfig::default(),
        }
    }
}
