//! In-process ring backend

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use super::{collect_since, LiveLogError, LogLine, SharedRingStore};

/// Ring held in this process only; shared between tasks, not between processes
pub struct MemoryRingStore {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
    lock_timeout: Duration,
}

impl MemoryRingStore {
    pub fn new(capacity: usize, lock_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            lock_timeout,
        }
    }

    async fn lock(&self) -> Result<MutexGuard<'_, VecDeque<LogLine>>, LiveLogError> {
        tokio::time::timeout(self.lock_timeout, self.lines.lock())
            .await
            .map_err(|_| LiveLogError::LockTimeout(self.lock_timeout))
    }
}

#[async_trait]
impl SharedRingStore for MemoryRingStore {
    async fn append(&self, line: &LogLine) -> Result<(), LiveLogError> {
        let mut lines = self.lock().await?;
        match lines.iter_mut().find(|l| l.key == line.key) {
            Some(existing) => *existing = line.clone(),
            None => lines.push_back(line.clone()),
        }
        while lines.len() > self.capacity {
            lines.pop_front();
        }
        Ok(())
    }

    async fn read_since(&self, cursor: &str) -> Result<Vec<LogLine>, LiveLogError> {
        let lines = self.lock().await?;
        Ok(collect_since(lines.iter().cloned(), cursor))
    }
}
