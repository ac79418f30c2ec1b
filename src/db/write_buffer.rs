//! Write buffer for per-lifecycle statistics
//!
//! Records are collected in memory while a request is processed and merged
//! into the statistics table when the request ends. Each raw record gets its
//! own slot so nothing recorded during the lifecycle is lost, and flushing
//! issues one upsert per record in insertion order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use super::{StatRecord, StatStore};
use crate::key;

/// Records appended while a flush runs get one extra pass, then wait for the next flush
const MAX_FLUSH_PASSES: usize = 2;

/// Outcome of a flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    /// Another flush was already in flight; nothing was written by this call
    pub deferred: bool,
}

/// In-memory statistics buffer owned by one request lifecycle
#[derive(Debug, Default)]
pub struct StatisticsBuffer {
    records: Mutex<Vec<(String, StatRecord)>>,
    flushing: AtomicBool,
}

/// Clears the in-flight flag on every exit path
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl StatisticsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a normalized record
    pub fn store(&self, record: StatRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push((key::next_key(), record));
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self) -> Vec<(String, StatRecord)> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Merge every buffered record into the store, in insertion order
    ///
    /// A failing upsert is logged and skipped. A call made while another
    /// flush is running returns immediately with `deferred` set.
    pub async fn flush(&self, store: &dyn StatStore) -> FlushReport {
        if self.flushing.swap(true, Ordering::AcqRel) {
            debug!("Statistics flush already in progress, deferring");
            return FlushReport {
                deferred: true,
                ..FlushReport::default()
            };
        }
        let _guard = FlushGuard(&self.flushing);

        let mut report = FlushReport::default();
        for pass in 0..MAX_FLUSH_PASSES {
            let batch = self.take();
            if batch.is_empty() {
                break;
            }
            debug!("Flushing {} statistics records (pass {})", batch.len(), pass + 1);

            for (key, record) in batch {
                match store.upsert(&record).await {
                    Ok(()) => report.written += 1,
                    Err(e) => {
                        warn!("Failed to write statistics record {}: {}", key, e);
                        report.failed += 1;
                    }
                }
            }
        }

        let left = self.len();
        if left > 0 {
            debug!("{} statistics records left for a later flush", left);
        }
        report
    }
}
