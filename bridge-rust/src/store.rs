//! Keyed last-value-wins table of marker positions fed by the stream decoder.
//!
//! Writers take the write lock for a whole decoded batch; readers only ever
//! get independent copies, so a reader never sees half of a batch or half of
//! a position.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use marker_types::{MarkerId, Vec3};
use serde::Deserialize;
use tokio::sync::RwLock;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Drop ids not seen for this long. `None` keeps every id for the
    /// lifetime of the process.
    pub stale_after_ms: Option<u64>,
}

impl StoreConfig {
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_ms.map(Duration::from_millis)
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Entry {
    position: Vec3,
    last_seen: Instant,
}

#[derive(Clone, Default)]
pub struct MarkerPositionStore {
    inner: Arc<RwLock<HashMap<MarkerId, Entry>>>,
}

impl MarkerPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite-or-insert one marker position.
    pub async fn upsert(&self, id: MarkerId, position: Vec3) {
        let now = Instant::now();
        self.inner.write().await.insert(id, Entry { position, last_seen: now });
    }

    /// Apply a batch under one write lock. Later entries for the same id win.
    pub async fn upsert_many(&self, batch: impl IntoIterator<Item = (MarkerId, Vec3)>) -> usize {
        let now = Instant::now();
        let mut map = self.inner.write().await;
        let mut n = 0;
        for (id, position) in batch {
            map.insert(id, Entry { position, last_seen: now });
            n += 1;
        }
        n
    }

    pub async fn get(&self, id: MarkerId) -> Option<Vec3> {
        self.inner.read().await.get(&id).map(|e| e.position)
    }

    /// Independent copy of every known position.
    pub async fn snapshot(&self) -> HashMap<MarkerId, Vec3> {
        self.inner.read().await.iter().map(|(&id, e)| (id, e.position)).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Remove ids whose last sighting is older than `max_age`. Returns the
    /// number removed.
    pub async fn evict_stale(&self, now: Instant, max_age: Duration) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, e| now.saturating_duration_since(e.last_seen) < max_age);
        before - map.len()
    }
}
