//! Gaussian Mixture Model with diagonal covariance.
//!
//! GMM provides **soft clustering** with probabilistic assignments,
//! allowing items to belong to multiple clusters with different probabilities.
//!
//! # The Probabilistic Model
//!
//! ```text
//! P(x) = Σₖ πₖ × N(x | μₖ, diag(σ²ₖ))
//! ```
//!
//! Each component carries `d` means, `d` variances and one mixing weight,
//! which is the parameter count the BIC penalty uses.
//!
//! # The EM Algorithm
//!
//! **E-step**: responsibilities
//! ```text
//! γₙₖ = πₖ × N(xₙ | μₖ, σ²ₖ) / Σⱼ πⱼ × N(xₙ | μⱼ, σ²ⱼ)
//! ```
//!
//! **M-step**:
//! - μₖ = Σₙ γₙₖ xₙ / Σₙ γₙₖ
//! - σ²ₖ = Σₙ γₙₖ (xₙ - μₖ)² / Σₙ γₙₖ + reg_covar
//! - πₖ = (1/N) Σₙ γₙₖ
//!
//! Iteration stops once the mean per-point log-likelihood changes by at most
//! `tol`. A fit that never gets there, or that produces a non-finite
//! likelihood, is reported as [`Error::ClusteringDegenerate`].
//!
//! # Initialization
//!
//! Means start at k-means++ picks from the data (first uniformly, the rest
//! proportional to squared distance to the nearest chosen mean); variances
//! start at the per-dimension data variance.

use super::traits::SoftClustering;
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1};
use rand::prelude::*;

/// Gaussian Mixture Model clustering.
#[derive(Debug, Clone)]
pub struct Gmm {
    n_components: usize,
    max_iter: usize,
    tol: f64,
    seed: u64,
    reg_covar: f64,
}

/// Result of one EM fit.
#[derive(Debug, Clone)]
pub struct GmmFit {
    /// `n × k` posterior probabilities.
    pub responsibilities: Array2<f64>,
    /// Total log-likelihood of the data under the fitted mixture.
    pub log_likelihood: f64,
    /// EM iterations performed.
    pub n_iter: usize,
}

impl GmmFit {
    /// Bayesian information criterion for a diagonal-covariance fit in `dim`
    /// dimensions: `-2 ln L + k (2d + 1) ln n`.
    pub fn bic(&self, dim: usize) -> f64 {
        let (n, k) = self.responsibilities.dim();
        let params_per_component = (2 * dim + 1) as f64;
        -2.0 * self.log_likelihood + k as f64 * params_per_component * (n as f64).ln()
    }
}

impl Gmm {
    /// Create a new GMM with default settings.
    pub fn new() -> Self {
        Self {
            n_components: 8,
            max_iter: 200,
            tol: 1e-3,
            seed: 42,
            reg_covar: 1e-6,
        }
    }

    /// Set number of components.
    pub fn with_n_components(mut self, n: usize) -> Self {
        self.n_components = n;
        self
    }

    /// Set maximum iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set convergence tolerance.
    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the variance floor.
    pub fn with_reg_covar(mut self, reg_covar: f64) -> Self {
        self.reg_covar = reg_covar;
        self
    }

    /// Run EM on an `n × d` matrix.
    pub fn fit(&self, data: &Array2<f64>) -> Result<GmmFit> {
        let (n, d) = data.dim();
        if n == 0 {
            return Err(Error::EmptyInput);
        }
        let k = self.n_components;
        if k == 0 || k > n {
            return Err(Error::invalid_config(
                "n_components",
                format!("{k} components for {n} points"),
            ));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut means = Self::init_means(data, k, &mut rng);

        let data_mean = data.mean_axis(ndarray::Axis(0)).unwrap_or_else(|| Array1::zeros(d));
        let mut data_var = Array1::from_elem(d, self.reg_covar);
        for row in data.rows() {
            for j in 0..d {
                let diff = row[j] - data_mean[j];
                data_var[j] += diff * diff / n as f64;
            }
        }
        let mut variances = Array2::zeros((k, d));
        for mut row in variances.rows_mut() {
            row.assign(&data_var);
        }

        let mut weights = Array1::from_elem(k, 1.0 / k as f64);
        let mut resp = Array2::zeros((n, k));
        let mut prev_mean_ll = f64::NEG_INFINITY;
        let mut log_probs = vec![0.0; k];

        for iter in 0..self.max_iter {
            // E-step
            let mut total_ll = 0.0;
            for i in 0..n {
                let point = data.row(i);
                for c in 0..k {
                    log_probs[c] = weights[c].ln()
                        + Self::log_gaussian(&point, &means.row(c), &variances.row(c));
                }
                let log_sum = Self::logsumexp(&log_probs);
                total_ll += log_sum;
                for c in 0..k {
                    resp[[i, c]] = (log_probs[c] - log_sum).exp();
                }
            }

            if !total_ll.is_finite() {
                return Err(Error::ClusteringDegenerate {
                    iterations: iter + 1,
                });
            }

            let mean_ll = total_ll / n as f64;
            if (mean_ll - prev_mean_ll).abs() <= self.tol {
                return Ok(GmmFit {
                    responsibilities: resp,
                    log_likelihood: total_ll,
                    n_iter: iter + 1,
                });
            }
            prev_mean_ll = mean_ll;

            // M-step
            let resp_sum: Vec<f64> = (0..k).map(|c| resp.column(c).sum()).collect();
            let total: f64 = resp_sum.iter().sum();

            for c in 0..k {
                weights[c] = resp_sum[c] / total;
                if resp_sum[c] <= 1e-10 {
                    continue;
                }
                let mut mean = Array1::<f64>::zeros(d);
                for i in 0..n {
                    mean.scaled_add(resp[[i, c]], &data.row(i));
                }
                mean /= resp_sum[c];

                let mut var = Array1::<f64>::zeros(d);
                for i in 0..n {
                    let r = resp[[i, c]];
                    for j in 0..d {
                        let diff = data[[i, j]] - mean[j];
                        var[j] += r * diff * diff;
                    }
                }
                var.mapv_inplace(|v| v / resp_sum[c] + self.reg_covar);

                means.row_mut(c).assign(&mean);
                variances.row_mut(c).assign(&var);
            }
        }

        Err(Error::ClusteringDegenerate {
            iterations: self.max_iter,
        })
    }

    /// k-means++ seeding.
    fn init_means(data: &Array2<f64>, k: usize, rng: &mut impl Rng) -> Array2<f64> {
        let (n, d) = data.dim();
        let mut means = Array2::zeros((k, d));

        let first = rng.random_range(0..n);
        means.row_mut(0).assign(&data.row(first));

        let mut nearest: Vec<f64> = (0..n)
            .map(|j| Self::squared_distance(&data.row(j), &means.row(0)))
            .collect();

        for i in 1..k {
            let total: f64 = nearest.iter().sum();
            let selected = if total <= 0.0 {
                rng.random_range(0..n)
            } else {
                let threshold = rng.random::<f64>() * total;
                let mut cumsum = 0.0;
                let mut selected = n - 1;
                for (j, &dist) in nearest.iter().enumerate() {
                    cumsum += dist;
                    if cumsum >= threshold {
                        selected = j;
                        break;
                    }
                }
                selected
            };
            means.row_mut(i).assign(&data.row(selected));

            for (j, slot) in nearest.iter_mut().enumerate() {
                let dist = Self::squared_distance(&data.row(j), &means.row(i));
                if dist < *slot {
                    *slot = dist;
                }
            }
        }

        means
    }

    fn squared_distance(a: &ArrayView1<'_, f64>, b: &ArrayView1<'_, f64>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
    }

    /// Log-density of a point under a diagonal Gaussian.
    fn log_gaussian(
        point: &ArrayView1<'_, f64>,
        mean: &ArrayView1<'_, f64>,
        var: &ArrayView1<'_, f64>,
    ) -> f64 {
        let d = point.len() as f64;
        let mut log_prob = -0.5 * d * (2.0 * std::f64::consts::PI).ln();

        for i in 0..point.len() {
            let diff = point[i] - mean[i];
            log_prob -= 0.5 * var[i].ln();
            log_prob -= 0.5 * diff * diff / var[i];
        }

        log_prob
    }

    /// Log-sum-exp for numerical stability.
    fn logsumexp(values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NEG_INFINITY;
        }
        let max_val = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max_val.is_infinite() {
            return max_val;
        }
        max_val
            + values
                .iter()
                .map(|&v| (v - max_val).exp())
                .sum::<f64>()
                .ln()
    }
}

impl Default for Gmm {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftClustering for Gmm {
    fn fit_predict_proba(&self, data: &[Vec<f32>]) -> Result<Vec<Vec<f64>>> {
        let matrix = super::to_matrix(data)?;
        let fit = self.fit(&matrix)?;
        Ok(fit
            .responsibilities
            .rows()
            .into_iter()
            .map(|row| row.to_vec())
            .collect())
    }

    fn n_clusters(&self) -> usize {
        self.n_components
    }
}
