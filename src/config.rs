//! Configuration for tree building, clustering, dispatch and retrieval.
//!
//! Every section is defaulted, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! [cluster]
//! max_clusters = 8
//! threshold = 0.1
//!
//! [build]
//! max_depth = 3
//!
//! [dispatcher]
//! credentials = ["key-a", "key-b"]
//!
//! [retrieval.weights]
//! similarity = 0.95
//! lexical = 0.05
//! ordinal = 0.0
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaptorConfig {
    /// Cluster selection.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Tree building.
    #[serde(default)]
    pub build: BuildConfig,
    /// Retrieval and scoring.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Embedding dispatch.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl RaptorConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| Error::invalid_config("toml", e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the `RAPTOR_*` / `EMBED_API_KEY` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RAPTOR_MAX_CLUSTERS") {
            self.cluster.max_clusters = parse_env("RAPTOR_MAX_CLUSTERS", &v)?;
        }
        if let Some(v) = lookup("RAPTOR_SIMILARITY_THRESHOLD") {
            self.cluster.threshold = parse_env("RAPTOR_SIMILARITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("RAPTOR_MAX_LEVELS") {
            self.build.max_depth = parse_env("RAPTOR_MAX_LEVELS", &v)?;
        }
        if let Some(v) = lookup("RAPTOR_RANDOM_SEED") {
            self.cluster.seed = parse_env("RAPTOR_RANDOM_SEED", &v)?;
        }
        if let Some(v) = lookup("EMBED_API_KEY") {
            let keys: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
            if !keys.is_empty() {
                self.dispatcher.credentials = keys;
            }
        }
        self.validate()
    }

    /// Check value ranges across all sections.
    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.build.validate()?;
        self.retrieval.validate()?;
        self.dispatcher.validate()
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_config(name, format!("cannot parse '{value}'")))
}

/// Cluster selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Upper bound on clusters per level.
    pub max_clusters: usize,
    /// Posterior probability above which a node joins a cluster.
    pub threshold: f64,
    /// Below this many nodes the level is not split (K = 1).
    pub min_split_size: usize,
    /// Target dimension of the random projection applied before fitting.
    pub reduction_dim: usize,
    /// EM iteration budget per candidate K.
    pub max_iter: usize,
    /// Change in mean per-point log-likelihood treated as converged.
    pub tol: f64,
    /// Variance floor added to every component.
    pub reg_covar: f64,
    /// Seed for projection and EM initialization.
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_clusters: 64,
            threshold: 0.1,
            min_split_size: 3,
            reduction_dim: 12,
            max_iter: 200,
            tol: 1e-3,
            reg_covar: 1e-6,
            seed: 42,
        }
    }
}

impl ClusterConfig {
    /// Set maximum clusters per level.
    pub fn with_max_clusters(mut self, max_clusters: usize) -> Self {
        self.max_clusters = max_clusters;
        self
    }

    /// Set the soft-assignment threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_clusters == 0 {
            return Err(Error::invalid_config("cluster.max_clusters", "must be >= 1"));
        }
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(Error::invalid_config("cluster.threshold", "must be in [0, 1)"));
        }
        if self.reduction_dim == 0 {
            return Err(Error::invalid_config("cluster.reduction_dim", "must be >= 1"));
        }
        if self.max_iter == 0 {
            return Err(Error::invalid_config("cluster.max_iter", "must be >= 1"));
        }
        if self.reg_covar <= 0.0 {
            return Err(Error::invalid_config("cluster.reg_covar", "must be > 0"));
        }
        Ok(())
    }
}

/// Tree building settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Maximum level (leaves are level 0).
    pub max_depth: usize,
    /// Token budget for the concatenated member texts sent to the summarizer.
    pub summary_input_tokens: usize,
    /// Token limit requested from the summarizer for its output.
    pub summary_max_tokens: usize,
    /// Concurrent summarizer calls per level.
    pub summary_concurrency: usize,
    /// Attempts per cluster before pass-through promotion.
    pub summary_max_attempts: usize,
    /// Base delay of the summarizer retry backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Cap of the summarizer retry backoff, in milliseconds.
    pub backoff_max_ms: u64,
    /// Overall build deadline, in seconds.
    pub deadline_secs: u64,
    /// Time in-flight summarizations may run past the deadline, in seconds.
    pub grace_period_secs: u64,
    /// Timeout for each storage call, in seconds.
    pub storage_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            summary_input_tokens: 8_000,
            summary_max_tokens: 512,
            summary_concurrency: 8,
            summary_max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            deadline_secs: 1_800,
            grace_period_secs: 30,
            storage_timeout_secs: 30,
        }
    }
}

impl BuildConfig {
    /// Set maximum depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set summarizer concurrency.
    pub fn with_summary_concurrency(mut self, n: usize) -> Self {
        self.summary_concurrency = n;
        self
    }

    /// Overall build deadline.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Grace period for in-flight summarizations.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Per-call storage timeout.
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    /// Summarizer retry delay before attempt `attempt + 1` (1-based attempt).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        let ms = self.backoff_base_ms.saturating_mul(1 << exp);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }

    fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(Error::invalid_config("build.max_depth", "must be >= 1"));
        }
        if self.summary_concurrency == 0 {
            return Err(Error::invalid_config("build.summary_concurrency", "must be >= 1"));
        }
        if self.summary_max_attempts == 0 {
            return Err(Error::invalid_config("build.summary_max_attempts", "must be >= 1"));
        }
        if self.summary_input_tokens == 0 {
            return Err(Error::invalid_config("build.summary_input_tokens", "must be >= 1"));
        }
        Ok(())
    }
}

/// Weights of the blended retrieval score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Cosine similarity.
    pub similarity: f32,
    /// Lexical overlap between query keywords and node text.
    pub lexical: f32,
    /// Ordinal proximity.
    pub ordinal: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            similarity: 0.95,
            lexical: 0.05,
            ordinal: 0.0,
        }
    }
}

impl ScoreWeights {
    /// Sum of all weights.
    pub fn total(&self) -> f32 {
        self.similarity + self.lexical + self.ordinal
    }
}

/// Retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Blend weights.
    pub weights: ScoreWeights,
    /// Extra slack before a candidate is pruned by its upper bound.
    pub early_termination_margin: f32,
    /// Ordinal distance at which the proximity signal reaches zero.
    pub ordinal_horizon: u32,
    /// Result cache TTL, in seconds.
    pub cache_ttl_secs: u64,
    /// Result cache capacity.
    pub cache_max_entries: u64,
    /// Default per-query deadline, in milliseconds.
    pub query_deadline_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            early_termination_margin: 0.0,
            ordinal_horizon: 5,
            cache_ttl_secs: 300,
            cache_max_entries: 100,
            query_deadline_ms: 2_000,
        }
    }
}

impl RetrievalConfig {
    /// Result cache TTL.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Default per-query deadline.
    pub fn query_deadline(&self) -> Duration {
        Duration::from_millis(self.query_deadline_ms)
    }

    fn validate(&self) -> Result<()> {
        let w = self.weights;
        if w.similarity < 0.0 || w.lexical < 0.0 || w.ordinal < 0.0 {
            return Err(Error::invalid_config("retrieval.weights", "must be non-negative"));
        }
        if w.total() <= 0.0 {
            return Err(Error::invalid_config("retrieval.weights", "must not all be zero"));
        }
        if self.early_termination_margin < 0.0 {
            return Err(Error::invalid_config(
                "retrieval.early_termination_margin",
                "must be >= 0",
            ));
        }
        if self.ordinal_horizon == 0 {
            return Err(Error::invalid_config("retrieval.ordinal_horizon", "must be >= 1"));
        }
        if self.cache_max_entries == 0 {
            return Err(Error::invalid_config("retrieval.cache_max_entries", "must be >= 1"));
        }
        Ok(())
    }
}

/// Embedding dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// One entry per credential slot.
    pub credentials: Vec<String>,
    /// Concurrent batches per `embed` call.
    pub concurrency: usize,
    /// Texts per backend request (capped by the backend's own maximum).
    pub batch_size: usize,
    /// Cooldown applied on a rate-limit response without a retry hint, in milliseconds.
    pub default_cooldown_ms: u64,
    /// Shortest cooldown applied on any rate-limit response, in milliseconds.
    pub min_cooldown_ms: u64,
    /// Longest a single batch may wait for a usable slot, in milliseconds.
    pub per_call_deadline_ms: u64,
    /// Timeout of one backend request, in milliseconds.
    pub request_timeout_ms: u64,
    /// Retries of transient errors per batch.
    pub max_retries: usize,
    /// Consecutive failures after which a slot is disabled.
    pub max_consecutive_failures: u32,
    /// Length of the rolling usage window, in seconds.
    pub usage_window_secs: u64,
    /// Usage estimate every slot starts with.
    pub initial_usage_tokens: u64,
    /// Lifetime of a cached chunk embedding, in seconds.
    pub embed_cache_ttl_secs: u64,
    /// Chunk embeddings kept in the cache; 0 disables it.
    pub embed_cache_max_entries: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            credentials: vec!["default".to_string()],
            concurrency: 4,
            batch_size: 128,
            default_cooldown_ms: 20_000,
            min_cooldown_ms: 50,
            per_call_deadline_ms: 60_000,
            request_timeout_ms: 30_000,
            max_retries: 3,
            max_consecutive_failures: 3,
            usage_window_secs: 60,
            initial_usage_tokens: 0,
            embed_cache_ttl_secs: 86_400,
            embed_cache_max_entries: 10_000,
        }
    }
}

impl DispatcherConfig {
    /// Replace the credential list.
    pub fn with_credentials<I, S>(mut self, credentials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.credentials = credentials.into_iter().map(Into::into).collect();
        self
    }

    /// Default cooldown after a rate-limit response.
    pub fn default_cooldown(&self) -> Duration {
        Duration::from_millis(self.default_cooldown_ms)
    }

    /// Cooldown for a rate-limit response carrying `retry_after`.
    pub fn cooldown(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or_else(|| self.default_cooldown())
            .max(Duration::from_millis(self.min_cooldown_ms))
    }

    /// Chunk embedding cache TTL.
    pub fn embed_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.embed_cache_ttl_secs)
    }

    /// Per-call deadline for acquiring a usable slot.
    pub fn per_call_deadline(&self) -> Duration {
        Duration::from_millis(self.per_call_deadline_ms)
    }

    /// Timeout of one backend request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Rolling usage window.
    pub fn usage_window(&self) -> Duration {
        Duration::from_secs(self.usage_window_secs)
    }

    /// Transient-error retry delay (capped exponential, 1-based attempt).
    pub fn retry_backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        Duration::from_millis(250 * (1 << capped))
    }

    fn validate(&self) -> Result<()> {
        if self.credentials.is_empty() {
            return Err(Error::invalid_config("dispatcher.credentials", "at least one required"));
        }
        if self.concurrency == 0 {
            return Err(Error::invalid_config("dispatcher.concurrency", "must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_config("dispatcher.batch_size", "must be >= 1"));
        }
        if self.usage_window_secs == 0 {
            return Err(Error::invalid_config("dispatcher.usage_window_secs", "must be >= 1"));
        }
        if self.min_cooldown_ms == 0 {
            return Err(Error::invalid_config("dispatcher.min_cooldown_ms", "must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        RaptorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = RaptorConfig::from_toml_str("").unwrap();
        assert_eq!(config.cluster.max_clusters, 64);
        assert_eq!(config.build.max_depth, 10);
        assert_eq!(config.retrieval.cache_max_entries, 100);
    }

    #[test]
    fn test_partial_toml() {
        let config = RaptorConfig::from_toml_str(
            r#"
            [cluster]
            max_clusters = 8

            [build]
            max_depth = 3

            [dispatcher]
            credentials = ["a", "b", "c"]

            [retrieval.weights]
            similarity = 0.8
            lexical = 0.1
            ordinal = 0.1
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster.max_clusters, 8);
        assert_eq!(config.cluster.threshold, 0.1);
        assert_eq!(config.build.max_depth, 3);
        assert_eq!(config.dispatcher.credentials.len(), 3);
        assert!((config.retrieval.weights.total() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = RaptorConfig::from_toml_str("[cluster]\nmax_clusters = 0\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { name: "cluster.max_clusters", .. }));

        let err = RaptorConfig::from_toml_str("[dispatcher]\ncredentials = []\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));

        assert!(RaptorConfig::from_toml_str("[cluster\n").is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RAPTOR_MAX_CLUSTERS", "16"),
            ("RAPTOR_MAX_LEVELS", "4"),
            ("RAPTOR_RANDOM_SEED", "7"),
            ("EMBED_API_KEY", "k1, k2 ,,k3"),
        ]
        .into_iter()
        .collect();

        let mut config = RaptorConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.cluster.max_clusters, 16);
        assert_eq!(config.build.max_depth, 4);
        assert_eq!(config.cluster.seed, 7);
        assert_eq!(config.dispatcher.credentials, vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_apply_env_reads_process_environment() {
        std::env::set_var("EMBED_API_KEY", " env-key-1 ,env-key-2,, ");
        let mut config = RaptorConfig::default();
        let applied = config.apply_env();
        std::env::remove_var("EMBED_API_KEY");

        applied.unwrap();
        assert_eq!(config.dispatcher.credentials, vec!["env-key-1", "env-key-2"]);
    }

    #[test]
    fn test_cooldown_has_floor() {
        let config = DispatcherConfig::default();
        assert_eq!(config.cooldown(None), Duration::from_secs(20));
        assert_eq!(config.cooldown(Some(Duration::ZERO)), Duration::from_millis(50));
        assert_eq!(config.cooldown(Some(Duration::from_secs(3))), Duration::from_secs(3));
    }

    #[test]
    fn test_bad_override_is_error() {
        let mut config = RaptorConfig::default();
        let err = config
            .apply_overrides(|name| (name == "RAPTOR_MAX_CLUSTERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { name: "RAPTOR_MAX_CLUSTERS", .. }));
    }

    #[test]
    fn test_backoff_is_capped() {
        let build = BuildConfig::default();
        assert_eq!(build.backoff(1), Duration::from_millis(1_000));
        assert_eq!(build.backoff(2), Duration::from_millis(2_000));
        assert_eq!(build.backoff(40), Duration::from_millis(30_000));
    }
}
