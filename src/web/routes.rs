//! HTTP routes with response caching

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    Extension, Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use cached::proc_macro::cached;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::ApiError;
use super::AppState;
use crate::db::{Context, ContextStat, Database, TrafficEvent};
use crate::key;
use crate::lifecycle::Lifecycle;
use crate::livelog::{Level, LogLine};

/// Upper bound on events accepted by one ingest call
const MAX_EVENTS_PER_REQUEST: usize = 1000;

type BearerHeader = Option<TypedHeader<Authorization<Bearer>>>;

/// Check the bearer token when one is configured
fn authorize(state: &AppState, bearer: BearerHeader) -> Result<(), ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(());
    };
    match bearer {
        Some(TypedHeader(Authorization(token))) if token.token() == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// How lines are rendered for the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Message only
    #[default]
    Wp,
    /// Timestamp and level prefix, then the message
    Full,
}

impl OutputMode {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "full" => OutputMode::Full,
            _ => OutputMode::Wp,
        }
    }

    fn render(&self, line: &LogLine) -> String {
        match self {
            OutputMode::Wp => line.line.clone(),
            OutputMode::Full => format!(
                "{} [{}] {}",
                key::render_timestamp(&line.key).unwrap_or_else(|| line.key.clone()),
                line.level.as_str().to_ascii_uppercase(),
                line.line
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LiveLogQuery {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default = "default_index")]
    pub index: String,
}

fn default_index() -> String {
    "0".to_string()
}

#[derive(Debug, Serialize)]
pub struct LiveLogItem {
    pub level: Level,
    pub line: String,
}

#[derive(Debug, Serialize)]
pub struct LiveLogResponse {
    pub index: String,
    pub items: BTreeMap<String, LiveLogItem>,
}

/// API: lines newer than `index`, at or above `level`
pub async fn api_livelog(
    State(state): State<Arc<AppState>>,
    bearer: BearerHeader,
    Query(query): Query<LiveLogQuery>,
) -> Result<Json<LiveLogResponse>, ApiError> {
    authorize(&state, bearer)?;

    let min_level = query.level.as_deref().map(Level::from_name).unwrap_or_default();
    let mode = query.mode.as_deref().map(OutputMode::from_name).unwrap_or_default();

    // The cursor moves past lines hidden by the level filter
    let (lines, index) = state.live_log.read_since(&query.index).await;
    let items = lines
        .into_iter()
        .filter(|line| line.level >= min_level)
        .map(|line| {
            let item = LiveLogItem {
                level: line.level,
                line: mode.render(&line),
            };
            (line.key, item)
        })
        .collect();

    Ok(Json(LiveLogResponse { index, items }))
}

#[derive(Debug, Serialize)]
pub struct LiveLogSettings {
    pub enabled: bool,
    pub buffer: usize,
    pub frequency: u64,
}

/// API: viewer settings
pub async fn api_livelog_settings(
    State(state): State<Arc<AppState>>,
    bearer: BearerHeader,
) -> Result<Json<LiveLogSettings>, ApiError> {
    authorize(&state, bearer)?;
    Ok(Json(LiveLogSettings {
        enabled: state.live_log.is_enabled(),
        buffer: state.livelog.buffer,
        frequency: state.livelog.frequency,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TrafficEventPayload {
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub site: Option<i64>,
    #[serde(default)]
    pub context: Option<Context>,
    #[serde(default)]
    pub id: Option<String>,
    pub verb: String,
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub latency_ms: u32,
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
}

impl TrafficEventPayload {
    fn into_event(self, default_site: i64) -> TrafficEvent {
        let mut event = TrafficEvent::new(
            self.context.unwrap_or(Context::Outbound),
            &self.verb,
            &self.scheme,
            &self.authority,
            &self.endpoint,
        )
        .with_response(self.code, self.latency_ms)
        .with_sizes(self.bytes_in, self.bytes_out)
        .with_site(self.site.unwrap_or(default_site));
        if let Some(at) = self.at {
            event = event.with_time(at);
        }
        if let Some(id) = self.id {
            event = event.with_id(id);
        }
        event
    }
}

#[derive(Debug, Deserialize)]
pub struct TrafficPayload {
    pub events: Vec<TrafficEventPayload>,
}

#[derive(Debug, Serialize)]
pub struct TrafficAccepted {
    pub accepted: usize,
}

/// API: record reported calls into this request's lifecycle
pub async fn api_traffic(
    State(state): State<Arc<AppState>>,
    Extension(lifecycle): Extension<Lifecycle>,
    bearer: BearerHeader,
    payload: Result<Json<TrafficPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<TrafficAccepted>), ApiError> {
    authorize(&state, bearer)?;
    let Json(payload) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    if payload.events.len() > MAX_EVENTS_PER_REQUEST {
        return Err(ApiError::BadRequest(format!(
            "too many events: {} (max {})",
            payload.events.len(),
            MAX_EVENTS_PER_REQUEST
        )));
    }

    let accepted = payload.events.len();
    for event in payload.events {
        lifecycle.record(&event.into_event(state.statistics.site)).await;
    }
    tracing::debug!("Lifecycle {} accepted {} reported events", lifecycle.id(), accepted);

    Ok((StatusCode::ACCEPTED, Json(TrafficAccepted { accepted })))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_days")]
    pub days: i64,
    #[serde(default)]
    pub site: Option<i64>,
}

fn default_days() -> i64 {
    30
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub days: i64,
    pub site: Option<i64>,
    pub total_hits: i64,
    pub contexts: Vec<ContextStat>,
}

/// Cached stats query - 5 minute TTL
#[cached(time = 300, key = "(i64, Option<i64>)", convert = r#"{ (days, site) }"#)]
async fn get_cached_stats(days: i64, site: Option<i64>, db: Database) -> StatsResponse {
    let contexts = db.get_context_stats(days, site).await.unwrap_or_default();
    StatsResponse {
        days,
        site,
        total_hits: contexts.iter().map(|c| c.hits).sum(),
        contexts,
    }
}

/// Cached distinct contexts - 5 minute TTL
#[cached(time = 300, key = "(i64, Option<i64>)", convert = r#"{ (days, site) }"#)]
async fn get_cached_contexts(days: i64, site: Option<i64>, db: Database) -> Vec<Context> {
    db.get_distinct_contexts(days, site).await.unwrap_or_default()
}

/// Cached oldest date - 1 hour TTL
#[cached(time = 3600, key = "()", convert = r#"{ () }"#)]
async fn get_cached_oldest_date(db: Database) -> Option<NaiveDate> {
    db.get_oldest_date().await.unwrap_or_default()
}

/// API: per-context statistics (cached for 5 minutes)
pub async fn api_stats(
    State(state): State<Arc<AppState>>,
    bearer: BearerHeader,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    authorize(&state, bearer)?;
    Ok(Json(get_cached_stats(query.days, query.site, state.db.clone()).await))
}

/// API: contexts seen in the window (cached for 5 minutes)
pub async fn api_contexts(
    State(state): State<Arc<AppState>>,
    bearer: BearerHeader,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<Context>>, ApiError> {
    authorize(&state, bearer)?;
    Ok(Json(get_cached_contexts(query.days, query.site, state.db.clone()).await))
}

#[derive(Debug, Serialize)]
pub struct OldestResponse {
    pub oldest: Option<NaiveDate>,
}

/// API: oldest stored day (cached for 1 hour)
pub async fn api_oldest(
    State(state): State<Arc<AppState>>,
    bearer: BearerHeader,
) -> Result<Json<OldestResponse>, ApiError> {
    authorize(&state, bearer)?;
    Ok(Json(OldestResponse {
        oldest: get_cached_oldest_date(state.db.clone()).await,
    }))
}

/// Warm the stats cache for the default window (called on startup)
pub async fn warm_cache(db: &Database) {
    tracing::info!("Warming cache for {} day window...", default_days());

    let _ = tokio::join!(
        get_cached_stats(default_days(), None, db.clone()),
        get_cached_contexts(default_days(), None, db.clone()),
        get_cached_oldest_date(db.clone())
    );

    tracing::info!("Cache warmed successfully");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_modes() {
        let line = LogLine {
            key: "20240305070809000042000000123400000001".to_string(),
            level: Level::Warning,
            line: "outbound GET https://a/b 404 3ms in:0B out:0B".to_string(),
        };
        assert_eq!(OutputMode::from_name("wp").render(&line), line.line);
        assert_eq!(OutputMode::from_name("unknown"), OutputMode::Wp);
        assert_eq!(
            OutputMode::from_name("FULL").render(&line),
            "2024-03-05 07:08:09.000042 [WARNING] outbound GET https://a/b 404 3ms in:0B out:0B"
        );
    }

    #[test]
    fn test_payload_defaults_to_outbound() {
        let payload: TrafficEventPayload = serde_json::from_str(
            r#"{"verb":"post","scheme":"https","authority":"api.x.io","endpoint":"/v2/pay","code":200,"latency_ms":42}"#,
        )
        .unwrap();
        let event = payload.into_event(3);
        assert_eq!(event.context, Context::Outbound);
        assert_eq!(event.site, 3);
        assert_eq!(event.latency_ms, 42);
        assert_eq!(event.id, "-");
    }
}
