//! RAPTOR-style recursive tree building.
//!
//! RAPTOR (Recursive Abstractive Processing for Tree-Organized Retrieval)
//! builds a tree by:
//! 1. Clustering the nodes of the current level
//! 2. Summarizing each cluster
//! 3. Embedding the summaries, which become the next level
//!
//! ```text
//! Start ──► ClusterLevel ──► Summarize ──► Embed ──► CheckStop ──► Done
//!               ▲                                        │
//!               └──────────────── next level ◄───────────┘
//! ```
//!
//! The build stops when a level has a single node, when `max_depth` is
//! reached, or when clustering no longer shrinks the level.
//!
//! ## References
//!
//! Sarthi et al. (2024). "RAPTOR: Recursive Abstractive Processing for
//! Tree-Organized Retrieval." ICLR 2024.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::node::{Chunk, NodeKind, TreeNode};
use super::snapshot::TreeSnapshot;
use super::validate::ensure_consistent;
use crate::cluster::{Assignment, Clustering};
use crate::config::BuildConfig;
use crate::embed::{EmbedKind, EmbeddingDispatcher, EmbeddingVector};
use crate::error::{Error, Result};
use crate::summarize::{
    pass_through_text, summarize_with_retry, truncate_to_budget, SummaryRequest, Summarizer,
};

/// Collection build number assigned by the store on persist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeVersion {
    /// Collection the tree belongs to.
    pub collection: String,
    /// Monotonically increasing per collection, starting at 1.
    pub version: u64,
}

/// What happened during one build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    /// Node count per level, leaves first.
    pub level_sizes: Vec<usize>,
    /// Selected K per built level (index 0 is level 1).
    pub cluster_counts: Vec<usize>,
    /// Clusters that became pass-through nodes.
    pub pass_through: usize,
    /// Levels where clustering degenerated and K = 1 was used.
    pub clustering_fallbacks: usize,
    /// Wall time of the build.
    pub elapsed: Duration,
}

/// Builds summary trees level by level.
pub struct TreeBuilder {
    dispatcher: Arc<EmbeddingDispatcher>,
    summarizer: Arc<dyn Summarizer>,
    clusterer: Arc<dyn Clustering>,
    config: BuildConfig,
}

impl std::fmt::Debug for TreeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeBuilder")
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish()
    }
}

struct LevelOutcome {
    texts: Vec<String>,
    kinds: Vec<NodeKind>,
}

impl TreeBuilder {
    /// Create a builder.
    pub fn new(
        dispatcher: Arc<EmbeddingDispatcher>,
        summarizer: Arc<dyn Summarizer>,
        clusterer: Arc<dyn Clustering>,
        config: BuildConfig,
    ) -> Self {
        Self {
            dispatcher,
            summarizer,
            clusterer,
            config,
        }
    }

    /// The build configuration.
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Build a tree, embedding the chunks through the dispatcher.
    pub async fn build(
        &self,
        collection: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(TreeSnapshot, BuildReport)> {
        self.build_with_embeddings(collection, chunks, None).await
    }

    /// Build a tree, reusing caller-supplied leaf embeddings when given.
    #[instrument(skip(self, chunks, embeddings), fields(chunks = chunks.len()))]
    pub async fn build_with_embeddings(
        &self,
        collection: &str,
        chunks: Vec<Chunk>,
        embeddings: Option<Vec<EmbeddingVector>>,
    ) -> Result<(TreeSnapshot, BuildReport)> {
        if chunks.is_empty() {
            return Err(Error::EmptyInput);
        }
        let started = Instant::now();
        let deadline = started + self.config.deadline();
        let hard_deadline = deadline + self.config.grace_period();

        let embeddings = match embeddings {
            Some(e) if e.len() != chunks.len() => {
                return Err(Error::DimensionMismatch {
                    expected: chunks.len(),
                    found: e.len(),
                });
            }
            Some(e) => e,
            None => {
                let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                self.embed_before(&texts, hard_deadline).await?
            }
        };

        let mut nodes: Vec<TreeNode> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| TreeNode::leaf(collection, chunk, embedding))
            .collect();
        let mut report = BuildReport::default();
        let mut current: Vec<usize> = (0..nodes.len()).collect();
        report.level_sizes.push(current.len());
        info!(collection, leaves = current.len(), "leaf level ready");

        let mut level = 0;
        while current.len() > 1 && level < self.config.max_depth {
            if Instant::now() >= deadline {
                return Err(Error::BuildTimeout(self.config.deadline()));
            }
            level += 1;
            let level_started = Instant::now();

            let assignment = self.cluster_level(&nodes, &current, level, &mut report).await?;
            let outcome = self
                .summarize_level(&nodes, &current, &assignment, level, deadline, hard_deadline)
                .await?;
            let vectors = self.embed_before(&outcome.texts, hard_deadline).await?;
            report.pass_through += outcome
                .kinds
                .iter()
                .filter(|&&k| k == NodeKind::PassThrough)
                .count();

            let mut next = Vec::with_capacity(assignment.clusters.len());
            for (c, ((cluster, text), (kind, embedding))) in assignment
                .clusters
                .iter()
                .zip(outcome.texts)
                .zip(outcome.kinds.into_iter().zip(vectors))
                .enumerate()
            {
                let children: Vec<usize> = cluster.members.iter().map(|&m| current[m]).collect();
                let ordinal = children
                    .iter()
                    .map(|&i| nodes[i].ordinal)
                    .min()
                    .unwrap_or_default();
                let id = format!("{collection}/L{level}/C{c}");
                nodes.push(TreeNode::internal(
                    collection, id, level, kind, text, embedding, children, ordinal,
                ));
                next.push(nodes.len() - 1);
            }

            info!(
                collection,
                level,
                nodes = next.len(),
                k = assignment.k,
                elapsed_ms = level_started.elapsed().as_millis() as u64,
                "level built"
            );
            report.level_sizes.push(next.len());
            report.cluster_counts.push(assignment.k);

            let shrank = next.len() < current.len();
            current = next;
            if !shrank {
                debug!(level, "level did not shrink; stopping");
                break;
            }
        }

        // A level that ran into the grace period still overran the build.
        if Instant::now() >= deadline {
            return Err(Error::BuildTimeout(self.config.deadline()));
        }
        let snapshot = TreeSnapshot::new(collection, nodes);
        ensure_consistent(&snapshot)?;
        report.elapsed = started.elapsed();
        info!(
            collection,
            levels = snapshot.depth(),
            nodes = snapshot.len(),
            pass_through = report.pass_through,
            "tree built"
        );
        Ok((snapshot, report))
    }

    async fn cluster_level(
        &self,
        nodes: &[TreeNode],
        current: &[usize],
        level: usize,
        report: &mut BuildReport,
    ) -> Result<Assignment> {
        let vectors: Vec<Vec<f32>> = current
            .iter()
            .map(|&i| nodes[i].embedding.values().to_vec())
            .collect();
        let n = vectors.len();
        let clusterer = Arc::clone(&self.clusterer);
        let result = tokio::task::spawn_blocking(move || clusterer.cluster(&vectors))
            .await
            .map_err(|e| Error::TreeInconsistent(format!("clustering worker failed: {e}")))?;

        match result {
            Ok(assignment) => Ok(assignment),
            Err(Error::ClusteringDegenerate { iterations }) => {
                warn!(level, n, iterations, "clustering degenerate; using a single cluster");
                report.clustering_fallbacks += 1;
                Ok(Assignment::single(n))
            }
            Err(e) => Err(e),
        }
    }

    async fn summarize_level(
        &self,
        nodes: &[TreeNode],
        current: &[usize],
        assignment: &Assignment,
        level: usize,
        deadline: Instant,
        hard_deadline: Instant,
    ) -> Result<LevelOutcome> {
        let jobs: Vec<_> = assignment
            .clusters
            .iter()
            .enumerate()
            .map(|(c, cluster)| {
                let member_texts: Vec<String> = cluster
                    .members
                    .iter()
                    .map(|&m| nodes[current[m]].text.clone())
                    .collect();
                let texts = truncate_to_budget(&member_texts, self.config.summary_input_tokens);
                let request = SummaryRequest {
                    level,
                    cluster: c,
                    max_tokens: self.config.summary_max_tokens,
                };
                async move {
                    if Instant::now() >= deadline {
                        return Err(Error::BuildTimeout(self.config.deadline()));
                    }
                    match summarize_with_retry(self.summarizer.as_ref(), &texts, &request, &self.config)
                        .await
                    {
                        Ok(summary) => Ok((summary, NodeKind::Summary)),
                        Err(e @ Error::SummarizationFailed { .. }) => {
                            warn!(level, cluster = c, error = %e, "promoting cluster as pass-through");
                            Ok((pass_through_text(&texts), NodeKind::PassThrough))
                        }
                        Err(e) => Err(e),
                    }
                }
            })
            .collect();

        let results: Vec<(String, NodeKind)> = tokio::time::timeout_at(
            hard_deadline,
            stream::iter(jobs)
                .buffered(self.config.summary_concurrency.max(1))
                .try_collect(),
        )
        .await
        .map_err(|_| Error::BuildTimeout(self.config.deadline()))??;

        let (texts, kinds): (Vec<String>, Vec<NodeKind>) = results.into_iter().unzip();
        Ok(LevelOutcome { texts, kinds })
    }

    async fn embed_before(&self, texts: &[String], hard_deadline: Instant) -> Result<Vec<EmbeddingVector>> {
        tokio::time::timeout_at(hard_deadline, self.dispatcher.embed(texts, EmbedKind::Chunk))
            .await
            .map_err(|_| Error::BuildTimeout(self.config.deadline()))?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, unused_results)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, ClusterSelector};
    use crate::config::{ClusterConfig, DispatcherConfig};
    use crate::embed::HashEmbedBackend;
    use crate::hierarchy::HealthCheck;
    use crate::summarize::{from_fn, ConcatSummarizer, SummarizeError};

    /// Puts nodes into fixed-size groups in input order.
    struct FixedGroups(usize);

    impl Clustering for FixedGroups {
        fn cluster(&self, data: &[Vec<f32>]) -> Result<Assignment> {
            let clusters: Vec<Cluster> = (0..data.len())
                .collect::<Vec<_>>()
                .chunks(self.0)
                .map(|g| Cluster {
                    members: g.to_vec(),
                    weights: vec![1.0; g.len()],
                })
                .collect();
            Ok(Assignment {
                k: clusters.len(),
                clusters,
                bic: None,
            })
        }
    }

    struct Degenerate;

    impl Clustering for Degenerate {
        fn cluster(&self, _data: &[Vec<f32>]) -> Result<Assignment> {
            Err(Error::ClusteringDegenerate { iterations: 7 })
        }
    }

    fn dispatcher() -> Arc<EmbeddingDispatcher> {
        Arc::new(
            EmbeddingDispatcher::new(
                Arc::new(HashEmbedBackend::new(32)),
                DispatcherConfig::default(),
            )
            .unwrap(),
        )
    }

    fn builder(clusterer: Arc<dyn Clustering>, summarizer: Arc<dyn Summarizer>) -> TreeBuilder {
        TreeBuilder::new(
            dispatcher(),
            summarizer,
            clusterer,
            BuildConfig::default().with_max_depth(4),
        )
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk::new(format!("c{i}"), "doc", format!("chunk text number {i}"), i as u32))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_input() {
        let b = builder(Arc::new(FixedGroups(2)), Arc::new(ConcatSummarizer::new()));
        let err = b.build("kb", Vec::new()).await.unwrap_err();
        assert_eq!(err, Error::EmptyInput);
    }

    #[tokio::test]
    async fn test_single_chunk_has_only_leaf_level() {
        let b = builder(Arc::new(FixedGroups(2)), Arc::new(ConcatSummarizer::new()));
        let (tree, report) = b.build("kb", chunks(1)).await.unwrap();
        assert_eq!(tree.depth(), 1);
        assert_eq!(report.level_sizes, vec![1]);
    }

    #[tokio::test]
    async fn test_fixed_groups_build() {
        let b = builder(Arc::new(FixedGroups(3)), Arc::new(ConcatSummarizer::new()));
        let (tree, report) = b.build("kb", chunks(9)).await.unwrap();

        assert_eq!(report.level_sizes, vec![9, 3, 1]);
        assert_eq!(report.cluster_counts, vec![3, 1]);
        assert!(tree.is_healthy());

        let root = tree.roots()[0];
        assert_eq!(root.level, 2);
        assert_eq!(root.kind, NodeKind::Summary);
        assert_eq!(root.ordinal, 0);
        assert!(root.text.contains("chunk text number 8"));

        let l1 = tree.get_level(1).unwrap();
        assert_eq!(l1[1].ordinal, 3);
        assert_eq!(l1[1].id, "kb/L1/C1");
        assert_eq!(l1[1].text, "chunk text number 3 | chunk text number 4 | chunk text number 5");
    }

    #[tokio::test]
    async fn test_max_depth_stops_build() {
        let b = TreeBuilder::new(
            dispatcher(),
            Arc::new(ConcatSummarizer::new()),
            Arc::new(FixedGroups(2)),
            BuildConfig::default().with_max_depth(2),
        );
        let (tree, _) = b.build("kb", chunks(16)).await.unwrap();
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.level_sizes(), vec![16, 8, 4]);
    }

    #[tokio::test]
    async fn test_non_shrinking_level_stops_build() {
        let b = builder(Arc::new(FixedGroups(1)), Arc::new(ConcatSummarizer::new()));
        let (tree, report) = b.build("kb", chunks(4)).await.unwrap();
        assert_eq!(report.level_sizes, vec![4, 4]);
        assert_eq!(tree.depth(), 2);
    }

    #[tokio::test]
    async fn test_degenerate_clustering_falls_back_to_one_cluster() {
        let b = builder(Arc::new(Degenerate), Arc::new(ConcatSummarizer::new()));
        let (tree, report) = b.build("kb", chunks(5)).await.unwrap();
        assert_eq!(report.clustering_fallbacks, 1);
        assert_eq!(tree.level_sizes(), vec![5, 1]);
        assert_eq!(tree.roots()[0].children, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_cluster_becomes_pass_through() {
        let summarizer = from_fn(|texts: &[String], req: &SummaryRequest| {
            if req.cluster == 1 {
                Err(SummarizeError::Transient("model overloaded".into()))
            } else {
                Ok(format!("summary of {} texts", texts.len()))
            }
        });
        let b = builder(Arc::new(FixedGroups(2)), Arc::new(summarizer));
        let (tree, report) = b.build("kb", chunks(6)).await.unwrap();

        let l1 = tree.get_level(1).unwrap();
        assert_eq!(l1.len(), 3);
        assert_eq!(l1[0].kind, NodeKind::Summary);
        assert_eq!(l1[1].kind, NodeKind::PassThrough);
        assert_eq!(l1[1].text, "chunk text number 2\n\nchunk text number 3");
        assert_eq!(l1[2].kind, NodeKind::Summary);
        assert!(report.pass_through >= 1);
        assert!(tree.is_healthy());
    }

    #[tokio::test]
    async fn test_caller_embeddings_are_used() {
        let b = builder(Arc::new(FixedGroups(2)), Arc::new(ConcatSummarizer::new()));
        let input = chunks(2);
        let embeddings: Vec<EmbeddingVector> = input
            .iter()
            .map(|c| EmbeddingVector::new(HashEmbedBackend::new(32).embed_text(&c.text), "fnv1a-hash-32", &c.text))
            .collect();
        let (tree, _) = b
            .build_with_embeddings("kb", input, Some(embeddings.clone()))
            .await
            .unwrap();
        assert_eq!(tree.get_node(0).unwrap().embedding.values(), embeddings[0].values());

        let err = b
            .build_with_embeddings("kb", chunks(3), Some(embeddings))
            .await
            .unwrap_err();
        assert_eq!(err, Error::DimensionMismatch { expected: 3, found: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_build() {
        let b = TreeBuilder::new(
            dispatcher(),
            Arc::new(ConcatSummarizer::new()),
            Arc::new(FixedGroups(2)),
            BuildConfig {
                deadline_secs: 0,
                grace_period_secs: 0,
                ..BuildConfig::default()
            },
        );
        let err = b.build("kb", chunks(4)).await.unwrap_err();
        assert!(matches!(err, Error::BuildTimeout(_)));
    }

    /// Finishes every summary only after `delay`.
    struct SlowSummarizer(Duration);

    #[async_trait::async_trait]
    impl Summarizer for SlowSummarizer {
        async fn summarize(
            &self,
            texts: &[String],
            _request: &SummaryRequest,
        ) -> std::result::Result<String, SummarizeError> {
            tokio::time::sleep(self.0).await;
            Ok(texts.join(" "))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_finishing_inside_grace_period_still_times_out() {
        // The only level starts before the deadline and ends inside the grace period.
        let b = TreeBuilder::new(
            dispatcher(),
            Arc::new(SlowSummarizer(Duration::from_secs(2))),
            Arc::new(FixedGroups(2)),
            BuildConfig {
                deadline_secs: 1,
                grace_period_secs: 30,
                ..BuildConfig::default().with_max_depth(1)
            },
        );
        let err = b.build("kb", chunks(4)).await.unwrap_err();
        assert_eq!(err, Error::BuildTimeout(Duration::from_secs(1)));

        let in_time = TreeBuilder::new(
            dispatcher(),
            Arc::new(SlowSummarizer(Duration::from_millis(100))),
            Arc::new(FixedGroups(2)),
            BuildConfig {
                deadline_secs: 1,
                grace_period_secs: 30,
                ..BuildConfig::default().with_max_depth(1)
            },
        );
        let (tree, _) = in_time.build("kb", chunks(4)).await.unwrap();
        assert_eq!(tree.level_sizes(), vec![4, 2]);
    }

    #[tokio::test]
    async fn test_selector_driven_build_is_consistent() {
        let selector = ClusterSelector::new(ClusterConfig::default().with_max_clusters(4));
        let b = builder(Arc::new(selector), Arc::new(ConcatSummarizer::new()));
        let (tree, report) = b.build("kb", chunks(20)).await.unwrap();
        assert!(tree.is_healthy());
        assert_eq!(report.level_sizes[0], 20);
        assert!(report.level_sizes.len() >= 2);
        assert!(report.level_sizes[1] <= 4);
    }
}
