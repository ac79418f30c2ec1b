//! Traffic - HTTP traffic statistics with a live log viewer

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use traffic::config::Config;
use traffic::db::Database;
use traffic::livelog::LiveLog;
use traffic::web::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Load configuration
    let config = Config::load()?;

    // Initialize logging based on LOG_FORMAT env var
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting Traffic...");
    info!("Configuration loaded");

    // Initialize database
    if let Some(parent) = Path::new(&config.database.url).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    // Initialize the live log ring
    let live_log = LiveLog::from_config(&config.livelog);

    // Warm the cache for the default stats window
    web::warm_cache(&db).await;

    // Start web server (blocking)
    let state = Arc::new(AppState::new(&config, db, live_log));
    web::start_server(&config, state).await?;

    Ok(())
}
