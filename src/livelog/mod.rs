//! Live log: a bounded, shared ring of formatted traffic lines
//!
//! Writers append lines from any request (and any process, with the SQLite
//! backend); the admin viewer polls with the last key it has seen and gets
//! only newer lines back. Everything here is best-effort: a lock timeout or
//! an unreadable segment means "no new lines this poll", never an error for
//! the caller.

mod memory;
mod sqlite;

pub use memory::MemoryRingStore;
pub use sqlite::{segment_token, SqliteRingStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LiveLogBackend, LiveLogConfig};
use crate::key;

/// Severity of a log line, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Level {
    pub const ALL: &'static [Level] = &[
        Level::Debug,
        Level::Info,
        Level::Notice,
        Level::Warning,
        Level::Error,
        Level::Critical,
        Level::Alert,
        Level::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Alert => "alert",
            Level::Emergency => "emergency",
        }
    }

    /// Parse a level name, falling back to `Info`
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|l| l.as_str().eq_ignore_ascii_case(name.trim()))
            .unwrap_or_default()
    }
}

/// One formatted entry of the ring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub key: String,
    pub level: Level,
    pub line: String,
}

impl LogLine {
    pub fn new(level: Level, line: impl Into<String>) -> Self {
        Self {
            key: key::next_key(),
            level,
            line: line.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LiveLogError {
    #[error("lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("segment storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("segment directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bounded ring of log lines shared between writers and polling readers
///
/// `append` must be atomic with respect to other appends: two concurrent
/// writers never lose each other's line. Once an append returns, the segment
/// written to holds at most the store's capacity of lines, evicting the
/// oldest first. A store reading several segments (see `SqliteRingStore`)
/// bounds each one separately, so `read_since` can return up to capacity
/// times the number of segments.
#[async_trait]
pub trait SharedRingStore: Send + Sync {
    async fn append(&self, line: &LogLine) -> Result<(), LiveLogError>;

    /// Lines with a key strictly greater than `cursor`, in ascending key order
    async fn read_since(&self, cursor: &str) -> Result<Vec<LogLine>, LiveLogError>;
}

/// Merge lines from one or more segments: dedupe by key, sort, keep keys after `cursor`
pub fn collect_since(lines: impl IntoIterator<Item = LogLine>, cursor: &str) -> Vec<LogLine> {
    let mut merged: BTreeMap<String, LogLine> = BTreeMap::new();
    for line in lines {
        if line.key.as_str() > cursor {
            merged.entry(line.key.clone()).or_insert(line);
        }
    }
    merged.into_values().collect()
}

/// Cloneable handle applying the best-effort policy around a ring store
#[derive(Clone)]
pub struct LiveLog {
    store: Option<Arc<dyn SharedRingStore>>,
}

impl LiveLog {
    pub fn new(store: Arc<dyn SharedRingStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A live log that drops every line and never returns any
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Build the configured backend; failures leave the live log disabled
    pub fn from_config(config: &LiveLogConfig) -> Self {
        if !config.enabled {
            info!("Live log disabled");
            return Self::disabled();
        }

        let lock_timeout = Duration::from_millis(config.lock_timeout_ms);
        match config.backend {
            LiveLogBackend::Memory => {
                info!("Live log using in-process ring (buffer={})", config.buffer);
                Self::new(Arc::new(MemoryRingStore::new(config.buffer, lock_timeout)))
            }
            LiveLogBackend::Sqlite => {
                let installation = config.installation_path();
                match SqliteRingStore::open(
                    &config.directory_path(),
                    &installation,
                    config.exec_mode,
                    config.buffer,
                    lock_timeout,
                ) {
                    Ok(store) => {
                        info!(
                            "Live log using shared segments in {} (buffer={})",
                            config.directory_path().display(),
                            config.buffer
                        );
                        Self::new(Arc::new(store))
                    }
                    Err(e) => {
                        warn!("Live log unavailable, continuing without it: {}", e);
                        Self::disabled()
                    }
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Append a line; failures are logged and dropped
    pub async fn append(&self, level: Level, line: impl Into<String>) {
        self.append_line(LogLine::new(level, line)).await;
    }

    pub async fn append_line(&self, line: LogLine) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.append(&line).await {
            debug!("Live log append skipped: {}", e);
        }
    }

    /// Lines newer than `cursor` and the cursor to use next time
    pub async fn read_since(&self, cursor: &str) -> (Vec<LogLine>, String) {
        let Some(store) = &self.store else {
            return (Vec::new(), cursor.to_string());
        };
        match store.read_since(cursor).await {
            Ok(lines) => {
                let next = lines
                    .last()
                    .map(|l| l.key.clone())
                    .unwrap_or_else(|| cursor.to_string());
                (lines, next)
            }
            Err(e) => {
                debug!("Live log read skipped: {}", e);
                (Vec::new(), cursor.to_string())
            }
        }
    }
}

/// In-process consumer remembering the last key it has seen
#[derive(Debug, Clone, Default)]
pub struct LogCursor {
    last: String,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_key(key: impl Into<String>) -> Self {
        Self { last: key.into() }
    }

    pub fn position(&self) -> &str {
        &self.last
    }

    pub async fn poll(&mut self, live_log: &LiveLog) -> Vec<LogLine> {
        let (lines, next) = live_log.read_since(&self.last).await;
        self.last = next;
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(key: &str, text: &str) -> LogLine {
        LogLine {
            key: key.to_string(),
            level: Level::Info,
            line: text.to_string(),
        }
    }

    #[test]
    fn test_level_order_and_parsing() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warning < Level::Error);
        assert!(Level::Alert < Level::Emergency);
        assert_eq!(Level::from_name("WARNING"), Level::Warning);
        assert_eq!(Level::from_name("loud"), Level::Info);
    }

    #[test]
    fn test_collect_since_merges_dedupes_and_filters() {
        let web = vec![line("0003", "c"), line("0001", "a")];
        let cli = vec![line("0002", "b"), line("0003", "c again"), line("0004", "d")];

        let merged = collect_since(web.into_iter().chain(cli), "0001");
        let keys: Vec<&str> = merged.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(keys, vec!["0002", "0003", "0004"]);
    }

    #[test]
    fn test_collect_since_is_strictly_greater() {
        let merged = collect_since(vec![line("0005", "x")], "0005");
        assert!(merged.is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl SharedRingStore for BrokenStore {
        async fn append(&self, _line: &LogLine) -> Result<(), LiveLogError> {
            Err(LiveLogError::LockTimeout(Duration::from_millis(1)))
        }

        async fn read_since(&self, _cursor: &str) -> Result<Vec<LogLine>, LiveLogError> {
            Err(LiveLogError::LockTimeout(Duration::from_millis(1)))
        }
    }

    #[tokio::test]
    async fn test_failures_degrade_to_empty_poll() {
        let live_log = LiveLog::new(Arc::new(BrokenStore));
        live_log.append(Level::Error, "dropped").await;

        let (lines, cursor) = live_log.read_since("20240101").await;
        assert!(lines.is_empty());
        assert_eq!(cursor, "20240101");
    }

    #[tokio::test]
    async fn test_disabled_live_log_is_silent() {
        let live_log = LiveLog::disabled();
        assert!(!live_log.is_enabled());
        live_log.append(Level::Info, "ignored").await;
        let (lines, cursor) = live_log.read_since("0").await;
        assert!(lines.is_empty());
        assert_eq!(cursor, "0");
    }

    #[tokio::test]
    async fn test_cursor_polls_are_disjoint_and_exhaustive() {
        let live_log = LiveLog::new(Arc::new(MemoryRingStore::new(100, Duration::from_secs(1))));
        let mut cursor = LogCursor::new();

        for i in 0..3 {
            live_log.append(Level::Info, format!("first {}", i)).await;
        }
        let first = cursor.poll(&live_log).await;
        assert_eq!(first.len(), 3);
        assert_eq!(cursor.position(), first[2].key);

        // Nothing new: empty and the cursor stays put
        let position = cursor.position().to_string();
        assert!(cursor.poll(&live_log).await.is_empty());
        assert_eq!(cursor.position(), position);

        for i in 0..2 {
            live_log.append(Level::Info, format!("second {}", i)).await;
        }
        let second = cursor.poll(&live_log).await;
        let texts: Vec<&str> = second.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(texts, vec!["second 0", "second 1"]);
        assert!(first.iter().all(|a| second.iter().all(|b| a.key < b.key)));
    }
}
