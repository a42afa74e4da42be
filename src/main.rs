use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};

use talktime_server::config::ServerConfig;
use talktime_server::state::AppState;
use talktime_server::store::Store;

#[cfg(feature = "postgres")]
use talktime_server::store::PgStore;

const DEFAULT_PORT: u16 = 9001;

async fn open_store(config: &ServerConfig) -> Store {
    #[cfg(feature = "postgres")]
    {
        if let Some(ref db_url) = config.db_url {
            match PgStore::connect(db_url).await {
                Ok(pg) => {
                    info!("Postgres enabled (TALKTIME_DB_URL set).");
                    return Store::Postgres(pg);
                }
                Err(e) => log::warn!("Failed to open Postgres; continuing in memory: {}", e),
            }
        } else {
            info!("Postgres disabled (TALKTIME_DB_URL not set).");
        }
    }
    #[cfg(not(feature = "postgres"))]
    {
        if config.db_url.is_some() {
            log::warn!("TALKTIME_DB_URL set but built without the postgres feature; using memory store.");
        }
    }
    Store::memory()
}

#[tokio::main]
async fn main() {
    // Healthcheck mode: exit 0 if server is running (port in use), exit 1 if not
    if std::env::args().any(|a| a == "--healthcheck") {
        use std::net::TcpListener;
        let port = std::env::var("TALKTIME_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse::<SocketAddr>().ok())
            .map(|a| a.port())
            .unwrap_or(DEFAULT_PORT);
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(_) => std::process::exit(1),
            Err(_) => std::process::exit(0),
        }
    }

    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let store = open_store(&config).await;
    let state = Arc::new(AppState::new(&config, store));
    let backend = state.store.backend_name();
    let app = talktime_server::app(state);

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {}", config.bind_addr, e);
            std::process::exit(1);
        }
    };
    info!("Talktime listening on http://{} ({} store)", config.bind_addr, backend);
    info!("API: http://{}/api/...", config.bind_addr);
    info!("Webhook: http://{}/clerk-users-webhook", config.bind_addr);
    info!("Health check: http://{}/health", config.bind_addr);

    let graceful = axum::serve(listener, app).with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down");
    });

    if let Err(e) = graceful.await {
        error!("Server error: {}", e);
    }
}
