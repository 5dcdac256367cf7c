//! TTL-bounded cache of chunk embeddings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tracing::debug;

use super::{fingerprint, EmbedKind};

/// One embedded text under one model.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EmbedCacheKey {
    model: String,
    kind: EmbedKind,
    fingerprint: String,
}

impl EmbedCacheKey {
    /// Key of `text` embedded by `model` as `kind`.
    pub fn new(model: &str, kind: EmbedKind, text: &str) -> Self {
        Self {
            model: model.to_string(),
            kind,
            fingerprint: fingerprint(text),
        }
    }
}

/// Embedding cache shared by every call of a dispatcher.
pub struct EmbedCache {
    inner: Cache<EmbedCacheKey, Arc<Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for EmbedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl EmbedCache {
    /// Create a cache holding at most `max_entries` vectors for `ttl` each.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        debug!(max_entries, ttl_secs = ttl.as_secs(), "embedding cache initialized");
        Self {
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a vector.
    pub fn get(&self, key: &EmbedCacheKey) -> Option<Arc<Vec<f32>>> {
        let found = self.inner.get(key);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a vector.
    pub fn insert(&self, key: EmbedCacheKey, values: Vec<f32>) {
        self.inner.insert(key, Arc::new(values));
    }

    /// `(hits, misses)` so far.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
