use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::cache::{CacheKey, CacheStats, ResultCache};
use super::text;
use super::{RetrieveOptions, ScoredNode};
use crate::config::{RetrievalConfig, ScoreWeights};
use crate::embed::{EmbedKind, EmbeddingDispatcher};
use crate::error::{Error, Result};
use crate::hierarchy::TreeSnapshot;
use crate::storage::{with_timeout, TreeStore};

/// Ranks the nodes of persisted trees for queries.
pub struct RetrievalEngine {
    dispatcher: Arc<EmbeddingDispatcher>,
    store: Arc<dyn TreeStore>,
    cache: ResultCache,
    config: RetrievalConfig,
    storage_timeout: Duration,
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

/// Cosine and proximity of one candidate, plus its score upper bound.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    level: usize,
    similarity: f32,
    proximity: f32,
    bound: f32,
}

/// Signal weights after dropping the signals a query cannot use.
#[derive(Debug, Clone, Copy)]
struct Blend {
    similarity: f32,
    lexical: f32,
    ordinal: f32,
    total: f32,
}

impl Blend {
    fn new(weights: ScoreWeights, has_keywords: bool, has_anchor: bool) -> Self {
        let lexical = if has_keywords { weights.lexical } else { 0.0 };
        let ordinal = if has_anchor { weights.ordinal } else { 0.0 };
        let total = weights.similarity + lexical + ordinal;
        Self {
            similarity: weights.similarity,
            lexical,
            ordinal,
            total,
        }
    }

    fn score(&self, similarity: f32, lexical: f32, proximity: f32) -> f32 {
        if self.total <= 0.0 {
            return 0.0;
        }
        (self.similarity * similarity + self.lexical * lexical + self.ordinal * proximity)
            / self.total
    }
}

impl RetrievalEngine {
    /// Create an engine reading trees from `store`.
    pub fn new(
        dispatcher: Arc<EmbeddingDispatcher>,
        store: Arc<dyn TreeStore>,
        config: RetrievalConfig,
        storage_timeout: Duration,
    ) -> Self {
        let cache = ResultCache::new(config.cache_max_entries, config.cache_ttl());
        Self {
            dispatcher,
            store,
            cache,
            config,
            storage_timeout,
        }
    }

    /// Rank nodes of `collection` for `query`, best first.
    ///
    /// A collection without a tree yields an empty list. On deadline expiry
    /// the whole query fails with [`Error::RetrievalTimeout`].
    #[instrument(skip(self, options), fields(query_len = query.len()))]
    pub async fn retrieve(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
        options: &RetrieveOptions,
    ) -> Result<Vec<ScoredNode>> {
        let deadline = options.deadline.unwrap_or_else(|| self.config.query_deadline());
        tokio::time::timeout(deadline, self.retrieve_inner(collection, query, top_k, options))
            .await
            .map_err(|_| Error::RetrievalTimeout(deadline))?
    }

    async fn retrieve_inner(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
        options: &RetrieveOptions,
    ) -> Result<Vec<ScoredNode>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let key = CacheKey::new(collection, query, top_k, options);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.as_ref().clone());
        }
        // Read before the load: a rebuild that lands in between bumps it.
        let generation = self.cache.generation(collection);

        let Some(tree) = with_timeout(self.storage_timeout, self.store.load(collection)).await?
        else {
            debug!(collection, "no tree for collection");
            return Ok(Vec::new());
        };

        let query_vector = self
            .dispatcher
            .embed(&[query.to_string()], EmbedKind::Query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding_unavailable("no vector returned for query"))?;

        if tree.model() != Some(query_vector.model())
            || tree.dimension() != Some(query_vector.dimension())
        {
            debug!(collection, "query embedding not comparable with tree");
            return Ok(Vec::new());
        }

        let keywords = text::keywords(&text::normalize(query));
        let blend = Blend::new(
            self.config.weights,
            !keywords.is_empty(),
            options.anchor_ordinal.is_some(),
        );
        let unit_query = unit(query_vector.values());
        let scan_tree = Arc::clone(&tree);
        let scan_options = options.clone();
        let horizon = self.config.ordinal_horizon;
        let margin = self.config.early_termination_margin;

        let results = tokio::task::spawn_blocking(move || {
            rank(
                &scan_tree,
                &unit_query,
                &keywords,
                blend,
                &scan_options,
                horizon,
                margin,
                top_k,
            )
        })
        .await
        .map_err(|e| Error::TreeInconsistent(format!("scoring worker failed: {e}")))?;

        debug!(collection, results = results.len(), version = tree.version(), "query ranked");
        self.cache.insert(key, Arc::new(results.clone()), generation);
        Ok(results)
    }

    /// Drop every cached result of `collection`.
    pub fn invalidate_cache(&self, collection: &str) {
        self.cache.invalidate_collection(collection);
    }

    /// Cache hit/miss counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

fn unit(values: &[f32]) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        values.iter().map(|x| x / norm).collect()
    } else {
        values.to_vec()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Higher score first, then lower level, then earlier arena index.
fn rank_order(a: &ScoredNode, b: &ScoredNode) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.level.cmp(&b.level))
        .then(a.index.cmp(&b.index))
}

#[allow(clippy::too_many_arguments)]
fn rank(
    tree: &TreeSnapshot,
    unit_query: &[f32],
    keywords: &[String],
    blend: Blend,
    options: &RetrieveOptions,
    horizon: u32,
    margin: f32,
    top_k: usize,
) -> Vec<ScoredNode> {
    let eligible: Vec<usize> = (0..tree.depth())
        .filter(|&level| options.levels.accepts(level))
        .flat_map(|level| tree.level_indices(level).iter().copied())
        .collect();

    let candidate = |index: usize| -> Option<Candidate> {
        let node = tree.get_node(index)?;
        let similarity = dot(unit_query, tree.unit_vector(index)?);
        let proximity = options.anchor_ordinal.map_or(0.0, |anchor| {
            let distance = node.ordinal.abs_diff(anchor) as f32;
            (1.0 - distance / horizon.max(1) as f32).max(0.0)
        });
        Some(Candidate {
            index,
            level: node.level,
            similarity,
            proximity,
            bound: blend.score(similarity, 1.0, proximity),
        })
    };

    #[cfg(feature = "parallel")]
    let mut candidates: Vec<Candidate> = eligible.par_iter().filter_map(|&i| candidate(i)).collect();
    #[cfg(not(feature = "parallel"))]
    let mut candidates: Vec<Candidate> = eligible.iter().filter_map(|&i| candidate(i)).collect();

    candidates.sort_by(|a, b| {
        b.bound
            .total_cmp(&a.bound)
            .then(a.level.cmp(&b.level))
            .then(a.index.cmp(&b.index))
    });

    let mut best: Vec<ScoredNode> = Vec::with_capacity(top_k + 1);
    let mut scanned = 0usize;
    for c in &candidates {
        if best.len() == top_k {
            let kth = best[top_k - 1].score;
            if c.bound + margin < kth {
                break;
            }
        }
        scanned += 1;
        let Some(node) = tree.get_node(c.index) else {
            continue;
        };
        let lexical = text::overlap(keywords, &node.text);
        let scored = ScoredNode {
            id: node.id.clone(),
            index: c.index,
            level: c.level,
            kind: node.kind,
            text: node.text.clone(),
            ordinal: node.ordinal,
            document_id: node.document_id.clone(),
            score: blend.score(c.similarity, lexical, c.proximity),
            similarity: c.similarity,
            lexical,
            proximity: c.proximity,
        };
        let pos = best
            .binary_search_by(|probe| rank_order(probe, &scored))
            .unwrap_or_else(|p| p);
        best.insert(pos, scored);
        best.truncate(top_k);
    }
    debug!(candidates = candidates.len(), scanned, "scan finished");

    if let Some(floor) = options.min_score {
        best.retain(|r| r.score >= floor);
    }
    if let Some(budget) = options.token_budget {
        let mut used = 0usize;
        let mut keep = 0usize;
        for r in &best {
            let tokens = crate::embed::estimate_tokens(&r.text);
            if used + tokens > budget {
                break;
            }
            used += tokens;
            keep += 1;
        }
        best.truncate(keep);
    }
    best
}
