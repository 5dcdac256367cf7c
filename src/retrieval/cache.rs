//! TTL-bounded cache of ranked result lists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::RwLock;
use tracing::{debug, trace};
use xxhash_rust::xxh3::Xxh3;

use super::{LevelFilter, RetrieveOptions, ScoredNode};

/// Cache key: collection plus an xxh3 hash of the query and every parameter
/// that changes the result.
///
/// The raw text is hashed next to its normalized form: the query vector is
/// computed from the raw text, so two spellings may rank differently.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    collection: String,
    hash: u64,
}

impl CacheKey {
    /// Build the key for one query.
    pub fn new(
        collection: &str,
        query: &str,
        top_k: usize,
        options: &RetrieveOptions,
    ) -> Self {
        let mut h = Xxh3::new();
        write_field(&mut h, super::text::normalize(query).as_bytes());
        write_field(&mut h, query.as_bytes());
        write_field(&mut h, options.tenant.as_deref().unwrap_or("").as_bytes());
        write_field(&mut h, collection.as_bytes());
        h.update(&(top_k as u64).to_le_bytes());
        match options.levels {
            LevelFilter::All => h.update(&[0]),
            LevelFilter::LeavesOnly => h.update(&[1]),
            LevelFilter::Exact(l) => {
                h.update(&[2]);
                h.update(&(l as u64).to_le_bytes());
            }
            LevelFilter::Range(lo, hi) => {
                h.update(&[3]);
                h.update(&(lo as u64).to_le_bytes());
                h.update(&(hi as u64).to_le_bytes());
            }
        }
        h.update(&options.min_score.map_or(u32::MAX, f32::to_bits).to_le_bytes());
        h.update(&options.anchor_ordinal.map_or(u64::MAX, u64::from).to_le_bytes());
        h.update(&options.token_budget.map_or(u64::MAX, |b| b as u64).to_le_bytes());
        Self {
            collection: collection.to_string(),
            hash: h.digest(),
        }
    }

    /// Collection the entry belongs to.
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

fn write_field(h: &mut Xxh3, bytes: &[u8]) {
    h.update(&(bytes.len() as u64).to_le_bytes());
    h.update(bytes);
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Entries currently held (approximate).
    pub entries: u64,
}

/// Result cache shared by all queries of an engine.
///
/// Every collection carries a generation that invalidation bumps. A query
/// reads the generation before loading its tree and stores its result only
/// if the generation is unchanged, so a result ranked against a replaced
/// tree never lands after the invalidation.
pub struct ResultCache {
    inner: Cache<CacheKey, Arc<Vec<ScoredNode>>>,
    generations: RwLock<HashMap<String, u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl ResultCache {
    /// Create a cache holding at most `max_entries` lists for `ttl` each.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        debug!(max_entries, ttl_secs = ttl.as_secs(), "result cache initialized");
        Self {
            inner,
            generations: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a ranked list.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<ScoredNode>>> {
        match self.inner.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(collection = key.collection(), "cache hit");
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Current generation of `collection`.
    pub fn generation(&self, collection: &str) -> u64 {
        self.generations.read().get(collection).copied().unwrap_or(0)
    }

    /// Store a ranked list computed at `generation`.
    ///
    /// Returns `false` and stores nothing when the collection was invalidated
    /// since `generation` was read.
    pub fn insert(&self, key: CacheKey, value: Arc<Vec<ScoredNode>>, generation: u64) -> bool {
        let generations = self.generations.read();
        if generations.get(key.collection()).copied().unwrap_or(0) != generation {
            trace!(collection = key.collection(), "stale result not cached");
            return false;
        }
        self.inner.insert(key, value);
        true
    }

    /// Drop every entry of `collection` and bump its generation.
    pub fn invalidate_collection(&self, collection: &str) {
        let mut generations = self.generations.write();
        let generation = generations.entry(collection.to_string()).or_insert(0);
        *generation += 1;
        let target = collection.to_string();
        if self
            .inner
            .invalidate_entries_if(move |k, _| k.collection == target)
            .is_err()
        {
            self.inner.invalidate_all();
        }
        debug!(collection, generation = *generation, "result cache invalidated");
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.inner.entry_count(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, unused_results)]
mod tests {
    use super::*;
    use crate::hierarchy::NodeKind;

    fn result(id: &str) -> Arc<Vec<ScoredNode>> {
        Arc::new(vec![ScoredNode {
            id: id.to_string(),
            index: 0,
            level: 0,
            kind: NodeKind::Leaf,
            text: "t".into(),
            ordinal: 0,
            document_id: None,
            score: 1.0,
            similarity: 1.0,
            lexical: 1.0,
            proximity: 0.0,
        }])
    }

    #[test]
    fn test_key_depends_on_parameters() {
        let opts = RetrieveOptions::default();
        let a = CacheKey::new("kb", "solar panels", 5, &opts);
        assert_eq!(a, CacheKey::new("kb", "solar panels", 5, &opts));
        assert_ne!(a, CacheKey::new("kb", "solar panels", 6, &opts));
        assert_ne!(a, CacheKey::new("kb2", "solar panels", 5, &opts));
        assert_ne!(
            a,
            CacheKey::new("kb", "solar panels", 5, &opts.clone().with_levels(LevelFilter::LeavesOnly))
        );
        assert_ne!(
            a,
            CacheKey::new("kb", "solar panels", 5, &opts.clone().with_tenant("t1"))
        );
        assert_ne!(a, CacheKey::new("kb", "Solar  panels", 5, &opts));
    }

    #[test]
    fn test_hit_miss_and_invalidation() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        let k1 = CacheKey::new("kb", "q", 3, &RetrieveOptions::default());
        let k2 = CacheKey::new("other", "q", 3, &RetrieveOptions::default());

        assert!(cache.get(&k1).is_none());
        assert!(cache.insert(k1.clone(), result("a"), 0));
        assert!(cache.insert(k2.clone(), result("b"), 0));
        assert_eq!(cache.get(&k1).unwrap()[0].id, "a");

        cache.invalidate_collection("kb");
        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_insert_after_invalidation_is_dropped() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        let key = CacheKey::new("kb", "q", 3, &RetrieveOptions::default());

        let before = cache.generation("kb");
        cache.invalidate_collection("kb");
        assert_eq!(cache.generation("kb"), before + 1);
        assert_eq!(cache.generation("other"), 0);

        assert!(!cache.insert(key.clone(), result("stale"), before));
        assert!(cache.get(&key).is_none());

        assert!(cache.insert(key.clone(), result("fresh"), cache.generation("kb")));
        assert_eq!(cache.get(&key).unwrap()[0].id, "fresh");
    }
}
