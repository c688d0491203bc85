//! Capped line log mirroring transport activity for on-screen diagnostics.
//!
//! Lines are also emitted through `tracing` at debug level; this buffer is
//! what a status panel shows. Oldest lines are evicted once the cap is exceeded.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_LOG_LINES: usize = 6;

#[derive(Clone)]
pub struct RollingLog {
    lines: Arc<RwLock<VecDeque<String>>>,
    capacity: usize,
}

impl RollingLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(RwLock::new(VecDeque::with_capacity(capacity + 1))),
            capacity,
        }
    }

    /// Append a line and mirror it to the tracing log.
    pub async fn push(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(target: "marker_bridge::transport", "{line}");
        let mut lines = self.lines.write().await;
        lines.push_back(line);
        while lines.len() > self.capacity {
            lines.pop_front();
        }
    }

    pub async fn lines(&self) -> Vec<String> {
        self.lines.read().await.iter().cloned().collect()
    }

    /// Number of lines currently held that contain `needle`.
    pub async fn count_matching(&self, needle: &str) -> usize {
        self.lines.read().await.iter().filter(|l| l.contains(needle)).count()
    }
}

impl Default for RollingLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evicts_oldest_line_past_capacity() {
        let log = RollingLog::new(3);
        for i in 0..5 {
            log.push(format!("line {i}")).await;
        }
        assert_eq!(log.lines().await, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn zero_capacity_keeps_latest_line() {
        let log = RollingLog::new(0);
        log.push("a").await;
        log.push("b").await;
        assert_eq!(log.lines().await, vec!["b"]);
    }
}
