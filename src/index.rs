//! One entry point over builder, store and retrieval engine.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::cluster::{ClusterSelector, Clustering};
use crate::config::RaptorConfig;
use crate::embed::{EmbedBackend, EmbeddingDispatcher, SlotStats};
use crate::error::Result;
use crate::hierarchy::{BuildReport, Chunk, TreeBuilder, TreeVersion};
use crate::retrieval::{CacheStats, RetrievalEngine, RetrieveOptions, ScoredNode};
use crate::storage::{with_timeout, TreeStore};
use crate::summarize::Summarizer;

/// Builds, stores and queries summary trees.
///
/// ```rust
/// use std::sync::Arc;
/// use raptree::{Chunk, RaptorConfig, RaptorIndex, RetrieveOptions};
/// use raptree::embed::HashEmbedBackend;
/// use raptree::storage::InMemoryTreeStore;
/// use raptree::summarize::ConcatSummarizer;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let index = RaptorIndex::new(
///     RaptorConfig::default(),
///     Arc::new(HashEmbedBackend::new(64)),
///     Arc::new(ConcatSummarizer::new()),
///     Arc::new(InMemoryTreeStore::new()),
/// )
/// .unwrap();
///
/// let chunks = vec![
///     Chunk::new("a", "doc", "solar panels and sunlight", 0),
///     Chunk::new("b", "doc", "wind turbines and air", 1),
///     Chunk::new("c", "doc", "flour, sugar and butter", 2),
/// ];
/// let (version, _report) = index.build_tree("kb", chunks).await.unwrap();
/// assert_eq!(version.version, 1);
///
/// let hits = index
///     .retrieve("kb", "solar panels", 2, &RetrieveOptions::default())
///     .await
///     .unwrap();
/// assert!(hits.len() <= 2);
/// # });
/// ```
pub struct RaptorIndex {
    dispatcher: Arc<EmbeddingDispatcher>,
    builder: TreeBuilder,
    engine: RetrievalEngine,
    store: Arc<dyn TreeStore>,
    config: RaptorConfig,
}

impl std::fmt::Debug for RaptorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaptorIndex")
            .field("builder", &self.builder)
            .field("engine", &self.engine)
            .finish()
    }
}

impl RaptorIndex {
    /// Wire an index with the BIC cluster selector.
    pub fn new(
        config: RaptorConfig,
        backend: Arc<dyn EmbedBackend>,
        summarizer: Arc<dyn Summarizer>,
        store: Arc<dyn TreeStore>,
    ) -> Result<Self> {
        let clusterer = Arc::new(ClusterSelector::new(config.cluster.clone()));
        Self::with_clusterer(config, backend, summarizer, store, clusterer)
    }

    /// Wire an index with a custom clustering strategy.
    pub fn with_clusterer(
        config: RaptorConfig,
        backend: Arc<dyn EmbedBackend>,
        summarizer: Arc<dyn Summarizer>,
        store: Arc<dyn TreeStore>,
        clusterer: Arc<dyn Clustering>,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(EmbeddingDispatcher::new(backend, config.dispatcher.clone())?);
        let builder = TreeBuilder::new(
            Arc::clone(&dispatcher),
            summarizer,
            clusterer,
            config.build.clone(),
        );
        let engine = RetrievalEngine::new(
            Arc::clone(&dispatcher),
            Arc::clone(&store),
            config.retrieval.clone(),
            config.build.storage_timeout(),
        );
        Ok(Self {
            dispatcher,
            builder,
            engine,
            store,
            config,
        })
    }

    /// Build a tree over `chunks` and make it the collection's current tree.
    ///
    /// Nothing is persisted when the build fails. Cached results of the
    /// collection are dropped once the new tree is stored.
    #[instrument(skip(self, chunks), fields(chunks = chunks.len()))]
    pub async fn build_tree(
        &self,
        collection: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(TreeVersion, BuildReport)> {
        let (snapshot, report) = self.builder.build(collection, chunks).await?;
        let version =
            with_timeout(self.config.build.storage_timeout(), self.store.persist(snapshot)).await?;
        self.engine.invalidate_cache(collection);
        info!(
            collection,
            version = version.version,
            levels = report.level_sizes.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "tree persisted"
        );
        Ok((version, report))
    }

    /// Rank nodes of `collection` for `query`.
    pub async fn retrieve(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
        options: &RetrieveOptions,
    ) -> Result<Vec<ScoredNode>> {
        self.engine.retrieve(collection, query, top_k, options).await
    }

    /// Drop cached results of `collection`.
    pub fn invalidate_cache(&self, collection: &str) {
        self.engine.invalidate_cache(collection);
    }

    /// Remove a collection's tree and its cached results.
    pub async fn delete_tree(&self, collection: &str) -> Result<bool> {
        let existed =
            with_timeout(self.config.build.storage_timeout(), self.store.delete(collection)).await?;
        self.engine.invalidate_cache(collection);
        Ok(existed)
    }

    /// Result cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.engine.cache_stats()
    }

    /// Per-credential dispatcher state.
    pub fn slot_stats(&self) -> Vec<SlotStats> {
        self.dispatcher.slot_stats()
    }

    /// The configuration the index was built with.
    pub fn config(&self) -> &RaptorConfig {
        &self.config
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, unused_results)]
mod tests {
    use super::*;
    use crate::embed::{BackendError, EmbedKind, HashEmbedBackend};
    use crate::error::Error;
    use crate::storage::InMemoryTreeStore;
    use crate::summarize::ConcatSummarizer;

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk::new(format!("c{i}"), "doc", format!("passage {i} about topic {}", i % 3), i as u32))
            .collect()
    }

    fn index(store: Arc<InMemoryTreeStore>) -> RaptorIndex {
        let mut config = RaptorConfig::default();
        config.cluster = config.cluster.with_max_clusters(4);
        config.build = config.build.with_max_depth(2);
        RaptorIndex::new(
            config,
            Arc::new(HashEmbedBackend::new(32)),
            Arc::new(ConcatSummarizer::new()),
            store,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_persists_and_bumps_version() {
        let store = Arc::new(InMemoryTreeStore::new());
        let index = index(Arc::clone(&store));
        let (v1, report) = index.build_tree("kb", chunks(12)).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(report.level_sizes[0], 12);

        let (v2, _) = index.build_tree("kb", chunks(12)).await.unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_build_persists_nothing() {
        let store = Arc::new(InMemoryTreeStore::new());
        let index = index(Arc::clone(&store));
        let err = index.build_tree("kb", Vec::new()).await.unwrap_err();
        assert_eq!(err, Error::EmptyInput);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_build_keeps_previous_tree() {
        let store = Arc::new(InMemoryTreeStore::new());
        let good = index(Arc::clone(&store));
        good.build_tree("kb", chunks(6)).await.unwrap();

        let mut config = RaptorConfig::default();
        config.build.deadline_secs = 0;
        let bad = RaptorIndex::new(
            config,
            Arc::new(HashEmbedBackend::new(32)),
            Arc::new(ConcatSummarizer::new()),
            Arc::clone(&store) as Arc<dyn TreeStore>,
        )
        .unwrap();
        let err = bad.build_tree("kb", chunks(6)).await.unwrap_err();
        assert!(matches!(err, Error::BuildTimeout(_)));
        assert_eq!(store.load("kb").await.unwrap().unwrap().version(), 1);
    }

    /// Embeds chunks but rejects every joined summary text.
    struct RejectsSummaries(HashEmbedBackend);

    #[async_trait::async_trait]
    impl EmbedBackend for RejectsSummaries {
        fn model_id(&self) -> &str {
            self.0.model_id()
        }

        fn max_batch_size(&self) -> usize {
            self.0.max_batch_size()
        }

        async fn embed(
            &self,
            texts: &[String],
            kind: EmbedKind,
            credential: &str,
        ) -> std::result::Result<Vec<Vec<f32>>, BackendError> {
            if texts.iter().any(|t| t.contains(" | ")) {
                return Err(BackendError::Fatal("input rejected".into()));
            }
            self.0.embed(texts, kind, credential).await
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_mid_build_keeps_previous_tree() {
        let store = Arc::new(InMemoryTreeStore::new());
        let good = index(Arc::clone(&store));
        good.build_tree("kb", chunks(6)).await.unwrap();

        let mut config = RaptorConfig::default();
        config.cluster = config.cluster.with_max_clusters(4);
        let bad = RaptorIndex::new(
            config,
            Arc::new(RejectsSummaries(HashEmbedBackend::new(32))),
            Arc::new(ConcatSummarizer::new()),
            Arc::clone(&store) as Arc<dyn TreeStore>,
        )
        .unwrap();
        let err = bad.build_tree("kb", chunks(6)).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable { .. }), "{err:?}");
        // Leaves were embedded before the failure.
        assert_eq!(bad.slot_stats()[0].requests, 2);

        let kept = store.load("kb").await.unwrap().unwrap();
        assert_eq!(kept.version(), 1);
        assert_eq!(kept.leaves().len(), 6);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_futures_are_send() {
        let index = index(Arc::new(InMemoryTreeStore::new()));
        let opts = RetrieveOptions::default();
        assert_send(&index.build_tree("kb", chunks(2)));
        assert_send(&index.retrieve("kb", "passage", 3, &opts));
        assert_send(&index.delete_tree("kb"));
    }

    #[tokio::test]
    async fn test_rebuild_invalidates_cache() {
        let store = Arc::new(InMemoryTreeStore::new());
        let index = index(store);
        index.build_tree("kb", chunks(6)).await.unwrap();

        let opts = RetrieveOptions::default();
        index.retrieve("kb", "passage 1", 3, &opts).await.unwrap();
        index.retrieve("kb", "passage 1", 3, &opts).await.unwrap();
        assert_eq!(index.cache_stats().hits, 1);

        index.build_tree("kb", chunks(6)).await.unwrap();
        index.retrieve("kb", "passage 1", 3, &opts).await.unwrap();
        assert_eq!(index.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_delete_tree() {
        let store = Arc::new(InMemoryTreeStore::new());
        let index = index(store);
        index.build_tree("kb", chunks(4)).await.unwrap();
        assert!(index.delete_tree("kb").await.unwrap());
        let hits = index
            .retrieve("kb", "passage", 3, &RetrieveOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RaptorConfig::default();
        config.cluster.max_clusters = 0;
        let err = RaptorIndex::new(
            config,
            Arc::new(HashEmbedBackend::new(8)),
            Arc::new(ConcatSummarizer::new()),
            Arc::new(InMemoryTreeStore::new()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
