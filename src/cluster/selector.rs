//! BIC-driven choice of the cluster count for one tree level.
//!
//! ```text
//! vectors (n × d)
//!    │  random projection to min(reduction_dim, n - 2) dims
//!    ▼
//! for K in 1..=min(max_clusters, n - 1):
//!    fit GMM(K, seed + K)        ── skipped if EM degenerates
//!    BIC(K) = -2 ln L + K (2d + 1) ln n
//!    ▼
//! K* = argmin BIC (ties → smaller K)
//!    ▼
//! soft assignment: i ∈ c  ⇔  P(c | xᵢ) > threshold, else argmax
//! ```
//!
//! Levels with fewer than `min_split_size` nodes are not split at all.

use super::gmm::Gmm;
use super::projection::GaussianProjection;
use super::traits::Clustering;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use ndarray::Array2;
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// One cluster: member indices into the clustered level plus their posteriors.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Indices of member rows, ascending.
    pub members: Vec<usize>,
    /// Membership weight of each member (same order as `members`).
    pub weights: Vec<f64>,
}

impl Cluster {
    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the cluster has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Output of one clustering pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Selected component count.
    pub k: usize,
    /// Non-empty clusters in component order.
    pub clusters: Vec<Cluster>,
    /// BIC of the selected fit, if a fit was run.
    pub bic: Option<f64>,
}

impl Assignment {
    /// Everything in one cluster with full weight.
    pub fn single(n: usize) -> Self {
        Self {
            k: 1,
            clusters: vec![Cluster {
                members: (0..n).collect(),
                weights: vec![1.0; n],
            }],
            bic: None,
        }
    }
}

/// Chooses K by BIC over diagonal GMM fits and returns soft clusters.
#[derive(Debug, Clone, Default)]
pub struct ClusterSelector {
    config: ClusterConfig,
}

impl ClusterSelector {
    /// Create a selector.
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Reduce `data` to at most `min(reduction_dim, n - 2)` dimensions.
    fn reduce(&self, data: Array2<f64>) -> Result<Array2<f64>> {
        let (n, d) = data.dim();
        let target = self.config.reduction_dim.min(n.saturating_sub(2)).max(1);
        if d <= target {
            return Ok(data);
        }
        GaussianProjection::new(d, target, self.config.seed)?.project(&data)
    }

    fn fit_k(&self, data: &Array2<f64>, k: usize) -> Option<(usize, f64, Array2<f64>)> {
        let gmm = Gmm::new()
            .with_n_components(k)
            .with_max_iter(self.config.max_iter)
            .with_tol(self.config.tol)
            .with_reg_covar(self.config.reg_covar)
            .with_seed(self.config.seed.wrapping_add(k as u64));
        match gmm.fit(data) {
            Ok(fit) => {
                let bic = fit.bic(data.ncols());
                if bic.is_finite() {
                    Some((k, bic, fit.responsibilities))
                } else {
                    debug!(k, "skipping K with non-finite BIC");
                    None
                }
            }
            Err(e) => {
                debug!(k, error = %e, "skipping K");
                None
            }
        }
    }
}

impl Clustering for ClusterSelector {
    fn cluster(&self, data: &[Vec<f32>]) -> Result<Assignment> {
        let n = data.len();
        if n == 0 {
            return Err(Error::EmptyInput);
        }
        if n < self.config.min_split_size || n < 2 {
            return Ok(Assignment::single(n));
        }

        let reduced = self.reduce(super::to_matrix(data)?)?;
        let k_max = self.config.max_clusters.min(n - 1).max(1);

        #[cfg(feature = "parallel")]
        let fits: Vec<_> = (1..=k_max)
            .into_par_iter()
            .filter_map(|k| self.fit_k(&reduced, k))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let fits: Vec<_> = (1..=k_max).filter_map(|k| self.fit_k(&reduced, k)).collect();

        let mut best: Option<(usize, f64, Array2<f64>)> = None;
        for candidate in fits {
            match &best {
                Some((_, bic, _)) if candidate.1 >= *bic => {}
                _ => best = Some(candidate),
            }
        }

        let (k, bic, resp) = best.ok_or(Error::ClusteringDegenerate {
            iterations: self.config.max_iter,
        })?;
        let clusters = soft_assign(&resp, self.config.threshold);
        debug!(n, k, bic, clusters = clusters.len(), "selected cluster count");

        Ok(Assignment {
            k,
            clusters,
            bic: Some(bic),
        })
    }
}

/// Turn an `n × k` posterior matrix into clusters.
///
/// Row `i` joins every component whose posterior exceeds `threshold`; a row
/// with no such component joins its argmax. Components with no members are
/// dropped.
pub fn soft_assign(resp: &Array2<f64>, threshold: f64) -> Vec<Cluster> {
    let (n, k) = resp.dim();
    let mut clusters: Vec<Cluster> = (0..k)
        .map(|_| Cluster {
            members: Vec::new(),
            weights: Vec::new(),
        })
        .collect();

    for i in 0..n {
        let row = resp.row(i);
        let mut placed = false;
        for c in 0..k {
            if row[c] > threshold {
                clusters[c].members.push(i);
                clusters[c].weights.push(row[c]);
                placed = true;
            }
        }
        if !placed {
            let best = (0..k)
                .max_by(|&a, &b| row[a].total_cmp(&row[b]).then(b.cmp(&a)))
                .unwrap_or(0);
            if let Some(cluster) = clusters.get_mut(best) {
                cluster.members.push(i);
                cluster.weights.push(row[best]);
            }
        }
    }

    clusters.retain(|c| !c.is_empty());
    clusters
}

#[cfg(test)]
#[allow(clippy::unwrap_used, unused_results)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn blobs(per_blob: usize, centers: &[f32]) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        for &c in centers {
            for i in 0..per_blob {
                let jitter = i as f32 * 0.01;
                out.push(vec![c + jitter, c - jitter, c + 0.5 * jitter]);
            }
        }
        out
    }

    fn covered(assignment: &Assignment, n: usize) -> bool {
        let mut seen = vec![false; n];
        for cluster in &assignment.clusters {
            for &m in &cluster.members {
                seen[m] = true;
            }
        }
        seen.into_iter().all(|s| s)
    }

    #[test]
    fn test_small_level_is_one_cluster() {
        let selector = ClusterSelector::default();
        let a = selector.cluster(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(a.k, 1);
        assert_eq!(a.clusters[0].members, vec![0, 1]);
        assert!(a.bic.is_none());
    }

    #[test]
    fn test_single_node() {
        let a = ClusterSelector::default().cluster(&[vec![1.0]]).unwrap();
        assert_eq!(a, Assignment::single(1));
    }

    #[test]
    fn test_empty_input() {
        let err = ClusterSelector::default().cluster(&[]).unwrap_err();
        assert_eq!(err, Error::EmptyInput);
    }

    #[test]
    fn test_finds_separated_groups() {
        let data = blobs(6, &[0.0, 10.0, 20.0]);
        let selector = ClusterSelector::new(ClusterConfig::default().with_max_clusters(6));
        let a = selector.cluster(&data).unwrap();

        assert!(a.k >= 2 && a.k <= 6, "k = {}", a.k);
        assert!(covered(&a, data.len()));
        // Members of one blob never share a cluster with another blob's members.
        for cluster in &a.clusters {
            let blob_ids: std::collections::BTreeSet<usize> =
                cluster.members.iter().map(|m| m / 6).collect();
            assert_eq!(blob_ids.len(), 1, "mixed cluster {:?}", cluster.members);
        }
    }

    #[test]
    fn test_degenerate_when_nothing_converges() {
        let data = blobs(4, &[0.0, 5.0]);
        let config = ClusterConfig {
            max_iter: 1,
            ..ClusterConfig::default()
        };
        let err = ClusterSelector::new(config).cluster(&data).unwrap_err();
        assert!(matches!(err, Error::ClusteringDegenerate { iterations: 1 }));
    }

    #[test]
    fn test_soft_assign_threshold_and_fallback() {
        let resp = Array2::from_shape_vec(
            (3, 3),
            vec![
                0.6, 0.35, 0.05, // two memberships
                0.05, 0.9, 0.05, // one
                0.34, 0.33, 0.33, // all three above 0.1
            ],
        )
        .unwrap();
        let clusters = soft_assign(&resp, 0.1);
        assert_eq!(clusters[0].members, vec![0, 2]);
        assert_eq!(clusters[1].members, vec![0, 1, 2]);
        assert_eq!(clusters[2].members, vec![2]);

        // Nothing above a high threshold: argmax fallback, empty clusters dropped.
        let clusters = soft_assign(&resp, 0.95);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![0, 2]);
        assert_eq!(clusters[1].members, vec![1]);
    }

    #[test]
    fn test_high_dimensional_input_is_projected() {
        // 40 dims, 10 points: fit happens in min(12, 8) = 8 dims.
        let data: Vec<Vec<f32>> = (0..10)
            .map(|i| {
                let base = if i < 5 { 0.0 } else { 3.0 };
                (0..40).map(|j| base + ((i * 7 + j) % 5) as f32 * 0.01).collect()
            })
            .collect();
        let a = ClusterSelector::default().cluster(&data).unwrap();
        assert!(a.k >= 1 && a.k <= 9);
        assert!(covered(&a, data.len()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_k_bounds_and_determinism(
            points in prop::collection::vec(prop::collection::vec(-5.0f32..5.0, 4), 3..16),
            max_clusters in 1usize..8,
            seed in 0u64..1000,
        ) {
            let config = ClusterConfig::default()
                .with_max_clusters(max_clusters)
                .with_seed(seed);
            let selector = ClusterSelector::new(config);
            let n = points.len();

            match selector.cluster(&points) {
                Ok(a) => {
                    prop_assert!(a.k >= 1);
                    prop_assert!(a.k <= max_clusters.min(n - 1));
                    prop_assert!(a.clusters.len() <= a.k);
                    prop_assert!(covered(&a, n));
                    let again = selector.cluster(&points).unwrap();
                    prop_assert_eq!(a, again);
                }
                Err(e) => prop_assert!(
                    matches!(e, Error::ClusteringDegenerate { .. }),
                    "unexpected error {:?}",
                    e
                ),
            }
        }
    }
}
