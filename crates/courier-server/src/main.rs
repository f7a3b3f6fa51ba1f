//! `courier`: the WebSocket front end of the Courier messaging core.
//!
//! ```bash
//! COURIER_JWT_SECRET=change-me courier
//! courier --config /etc/courier/courier.toml
//! COURIER_PORT=9000 COURIER_DB_PATH=/var/lib/courier/courier.db courier
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use config::StoreBackend;
use courier_core::{
    Authenticator, Database, DurableStore, JwtAuthenticator, MemoryStore, RouterConfig,
    SessionConfig, SessionManager, SqliteStore,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,courier_core=debug,courier_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;
    tracing::info!(host = %config.host, port = config.port, "Starting Courier");

    let db = Arc::new(Database::open(&config.storage.db_path())?);

    let store: Arc<dyn DurableStore> = match config.storage.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::new(db.clone())),
    };
    tracing::info!(backend = ?config.storage.store_backend, "Durable store ready");

    let secret = config
        .auth
        .jwt_secret
        .clone()
        .context("auth.jwt_secret or COURIER_JWT_SECRET must be set")?;
    let authenticator: Arc<dyn Authenticator> = Arc::new(JwtAuthenticator::new(secret.as_bytes()));

    let session_config = SessionConfig {
        router: RouterConfig {
            max_rooms: config.limits.max_rooms,
            max_rooms_per_member: config.limits.max_rooms_per_connection,
            ..RouterConfig::default()
        },
        ..SessionConfig::default()
    };
    let sessions = SessionManager::with_config(db, store.clone(), session_config);

    let state = Arc::new(handlers::AppState::new(config, sessions, authenticator, store));

    handlers::run_server(state).await
}
