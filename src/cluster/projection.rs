//! Seeded Gaussian random projection.
//!
//! Embeddings arrive with hundreds or thousands of dimensions; fitting a
//! mixture there is slow and the covariance estimates are poor. A random
//! Gaussian matrix `R ∈ ℝ^{d×t}` with entries `N(0, 1/t)` approximately
//! preserves pairwise distances (Johnson-Lindenstrauss), so clustering in the
//! projected space finds the same groups at a fraction of the cost.
//!
//! The matrix is drawn from a `StdRng` seeded by the caller, so the same
//! seed and shape always give the same projection.

use crate::error::{Error, Result};
use ndarray::Array2;
use rand::prelude::*;
use rand_distr::Normal;

/// A fixed `input_dim × target_dim` projection matrix.
#[derive(Debug, Clone)]
pub struct GaussianProjection {
    matrix: Array2<f64>,
}

impl GaussianProjection {
    /// Draw a projection matrix.
    pub fn new(input_dim: usize, target_dim: usize, seed: u64) -> Result<Self> {
        if input_dim == 0 || target_dim == 0 {
            return Err(Error::invalid_config(
                "reduction_dim",
                format!("cannot project {input_dim} dims to {target_dim}"),
            ));
        }
        let std_dev = (1.0 / target_dim as f64).sqrt();
        let normal = Normal::new(0.0, std_dev)
            .map_err(|e| Error::invalid_config("reduction_dim", e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let matrix = Array2::from_shape_simple_fn((input_dim, target_dim), || normal.sample(&mut rng));
        Ok(Self { matrix })
    }

    /// Output dimension.
    pub fn target_dim(&self) -> usize {
        self.matrix.ncols()
    }

    /// Project an `n × input_dim` matrix to `n × target_dim`.
    pub fn project(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
        if data.ncols() != self.matrix.nrows() {
            return Err(Error::DimensionMismatch {
                expected: self.matrix.nrows(),
                found: data.ncols(),
            });
        }
        Ok(data.dot(&self.matrix))
    }
}
