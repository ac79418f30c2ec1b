//! Web server module

mod error;
mod middleware;
mod routes;

pub use routes::warm_cache;

use anyhow::Result;
use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::config::{Config, LiveLogConfig, StatisticsConfig};
use crate::db::Database;
use crate::livelog::LiveLog;
use middleware::RequestRecordingLayer;

/// Recording tasks spawned after responses, drained before shutdown completes
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished tasks so the set only holds running ones
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Wait for every task spawned so far; returns how many were awaited
    pub async fn drain(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let mut drained = 0;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Recording task failed: {}", e);
            }
            drained += 1;
        }
        drained
    }
}

pub struct AppState {
    pub db: Database,
    pub live_log: LiveLog,
    pub statistics: StatisticsConfig,
    pub livelog: LiveLogConfig,
    pub api_token: Option<String>,
    pub background: BackgroundTasks,
}

impl AppState {
    pub fn new(config: &Config, db: Database, live_log: LiveLog) -> Self {
        Self {
            db,
            live_log,
            statistics: config.statistics.clone(),
            livelog: config.livelog.clone(),
            api_token: config.server.api_token.clone(),
            background: BackgroundTasks::default(),
        }
    }
}

/// Build the application router with request recording
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Live log viewer (not recorded as traffic)
        .route("/api/livelog", get(routes::api_livelog))
        .route("/api/livelog/settings", get(routes::api_livelog_settings))
        // Reported outbound calls
        .route("/api/traffic", post(routes::api_traffic))
        // Statistics
        .route("/api/stats", get(routes::api_stats))
        .route("/api/stats/contexts", get(routes::api_contexts))
        .route("/api/stats/oldest", get(routes::api_oldest))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(RequestRecordingLayer::new(state.clone()))
        .with_state(state)
}

pub async fn start_server(config: &Config, state: Arc<AppState>) -> Result<()> {
    let app = router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let drained = state.background.drain().await;
    info!("Web server stopped ({} pending recordings flushed)", drained);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
