use std::sync::Arc;

use anyhow::Context;
use time::Duration;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::Key};
use tracing_subscriber::EnvFilter;

use household_ledger::config::Config;
use household_ledger::constants::*;
use household_ledger::database::init_db;
use household_ledger::routes::{AppState, build_router};
use household_ledger::scheduler::spawn_ticker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("household_ledger=debug,tower_http=debug")),
        )
        .init();

    let config = Config::from_env().context("Invalid configuration")?;
    let db = init_db(&config.data_path)
        .await
        .context("Failed to initialize ledger database")?;

    // TODO: swap MemoryStore for a persistent store so sessions survive restarts
    let store = MemoryStore::default();
    let key = Key::try_from(config.session_secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("SESSION_SECRET is not a usable signing key: {}", e))?;
    let session_layer = SessionManagerLayer::new(store)
        .with_secure(false)
        .with_name(SESSION_NAME)
        .with_expiry(Expiry::OnInactivity(Duration::days(SESSION_EXPIRY_DAYS)))
        .with_signed(key);

    if config.tick_interval_secs > 0 {
        spawn_ticker(db.clone(), config.tick_interval_secs);
        tracing::info!(interval_secs = config.tick_interval_secs, "scheduler loop started");
    }

    let bind_address = config.bind_address();
    let state = AppState {
        db,
        config: Arc::new(config),
    };
    let app = build_router(state).layer(session_layer);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!("Server running on http://{}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
