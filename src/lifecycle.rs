//! Per-request recording context
//!
//! A `Lifecycle` is created for each request, travels with it through the
//! request extensions, and is finished once the response has been produced.
//! It owns the statistics buffer for that request; nothing is shared between
//! lifecycles except the live log.

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::StatisticsConfig;
use crate::conversion::data_shorten;
use crate::db::{FlushReport, StatRecord, StatStore, StatisticsBuffer, TrafficEvent};
use crate::livelog::{Level, LiveLog};

#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    statistics_enabled: bool,
    buffer: StatisticsBuffer,
    live_log: LiveLog,
}

impl Lifecycle {
    pub fn new(statistics: &StatisticsConfig, live_log: LiveLog) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                statistics_enabled: statistics.enabled,
                buffer: StatisticsBuffer::new(),
                live_log,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Number of records waiting for the end of the lifecycle
    pub fn pending(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Buffer the event for the statistics table and publish it to the live log
    pub async fn record(&self, event: &TrafficEvent) {
        if self.inner.statistics_enabled {
            self.inner.buffer.store(StatRecord::from_event(event));
        }
        self.inner
            .live_log
            .append(level_for(event.code), format_line(event))
            .await;
    }

    /// Merge everything buffered during this lifecycle into the store
    pub async fn finish(&self, store: &dyn StatStore) -> FlushReport {
        let report = self.inner.buffer.flush(store).await;
        if report.written > 0 || report.failed > 0 {
            debug!(
                "Lifecycle {} flushed {} records ({} failed)",
                self.inner.id, report.written, report.failed
            );
        }
        report
    }
}

/// Severity of a traffic line from its status code
pub fn level_for(code: u16) -> Level {
    match code {
        0 | 500..=u16::MAX => Level::Error,
        400..=499 => Level::Warning,
        _ => Level::Info,
    }
}

/// One live log line for a traffic event
pub fn format_line(event: &TrafficEvent) -> String {
    let code = if event.code == 0 {
        "---".to_string()
    } else {
        event.code.to_string()
    };
    format!(
        "{} {} {} {} {}ms in:{}B out:{}B",
        event.context.as_str(),
        event.verb.to_ascii_uppercase(),
        event.url(),
        code,
        event.latency_ms,
        data_shorten(event.bytes_in as f64, 1),
        data_shorten(event.bytes_out as f64, 1)
    )
}
