//! Clustering for grouping tree nodes before summarization.
//!
//! ## Soft Clustering
//!
//! **Hard clustering** assigns each item to exactly one cluster. Simple, but
//! loses information when items genuinely span multiple groups.
//!
//! **Soft clustering** gives each item a probability distribution over
//! clusters. A text chunk might be 60% about "machine learning" and 30% about
//! "statistics"; with a membership threshold of 0.1 it is summarized under
//! both. The node itself is never duplicated: clusters hold indices.
//!
//! ## Choosing K
//!
//! The number of clusters per level is not known in advance. The
//! [`ClusterSelector`] fits a diagonal [`Gmm`] for every candidate K and keeps
//! the one with the lowest Bayesian information criterion:
//!
//! ```text
//! BIC(K) = -2 ln L̂ + K (2d + 1) ln n
//! ```
//!
//! The likelihood term rewards fit, the penalty rewards fewer components.
//!
//! ## Usage
//!
//! ```rust
//! use raptree::cluster::{ClusterSelector, Clustering};
//! use raptree::config::ClusterConfig;
//!
//! let data = vec![
//!     vec![0.0, 0.0],
//!     vec![0.1, 0.1],
//!     vec![0.05, 0.0],
//!     vec![10.0, 10.0],
//!     vec![10.1, 10.1],
//!     vec![10.0, 10.05],
//! ];
//!
//! let selector = ClusterSelector::new(ClusterConfig::default().with_max_clusters(4));
//! let assignment = selector.cluster(&data).unwrap();
//! assert!(assignment.k >= 2);
//! ```

mod gmm;
mod projection;
mod selector;
mod traits;

pub use gmm::{Gmm, GmmFit};
pub use projection::GaussianProjection;
pub use selector::{soft_assign, Assignment, Cluster, ClusterSelector};
pub use traits::{Clustering, SoftClustering};

use crate::error::{Error, Result};
use ndarray::Array2;

/// Copy row vectors into an `n × d` matrix, checking that dimensions agree.
pub(crate) fn to_matrix(data: &[Vec<f32>]) -> Result<Array2<f64>> {
    let n = data.len();
    let d = data.first().map(Vec::len).ok_or(Error::EmptyInput)?;

    let mut flat: Vec<f64> = Vec::with_capacity(n * d);
    for point in data {
        if point.len() != d {
            return Err(Error::DimensionMismatch {
                expected: d,
                found: point.len(),
            });
        }
        flat.extend(point.iter().map(|&v| v as f64));
    }
    Array2::from_shape_vec((n, d), flat).map_err(|e| Error::TreeInconsistent(e.to_string()))
}
