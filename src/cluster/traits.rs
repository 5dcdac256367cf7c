//! Clustering traits.

use super::selector::Assignment;
use crate::error::Result;

/// Partitions one tree level into clusters, choosing the cluster count itself.
///
/// The tree builder runs implementations on a blocking worker, so they may be
/// CPU-heavy but must not block on I/O.
pub trait Clustering: Send + Sync {
    /// Cluster `data` (one row per node).
    ///
    /// Every input index appears in at least one cluster of the returned
    /// assignment.
    fn cluster(&self, data: &[Vec<f32>]) -> Result<Assignment>;
}

/// Trait for soft clustering algorithms with a fixed component count.
pub trait SoftClustering {
    /// Fit and return soft cluster assignments (probabilities).
    ///
    /// Returns a matrix where entry \[i\]\[k\] is the probability that
    /// point i belongs to cluster k.
    fn fit_predict_proba(&self, data: &[Vec<f32>]) -> Result<Vec<Vec<f64>>>;

    /// Number of components.
    fn n_clusters(&self) -> usize;
}
