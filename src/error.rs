use std::time::Duration;

use thiserror::Error;

/// Result alias for `raptree`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by tree building, clustering, dispatch and retrieval.
///
/// Recoverable failures (`ClusteringDegenerate`, `SummarizationFailed`) are
/// handled inside the tree builder and only surface through
/// [`BuildReport`](crate::hierarchy::BuildReport) counters and logs; the other
/// variants reach the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Input was empty.
    #[error("empty input provided")]
    EmptyInput,

    /// Every credential is exhausted or the backend is unreachable.
    #[error("embedding backend unavailable: {reason}")]
    EmbeddingUnavailable {
        /// Last failure observed before giving up.
        reason: String,
    },

    /// The mixture-model fit did not converge for any candidate cluster count.
    #[error("clustering degenerate: no fit converged within {iterations} iterations")]
    ClusteringDegenerate {
        /// Iteration budget per fit.
        iterations: usize,
    },

    /// The summarizer kept failing for a cluster.
    #[error("summarization failed for cluster {cluster} after {attempts} attempts: {reason}")]
    SummarizationFailed {
        /// Cluster index within its level.
        cluster: usize,
        /// Attempts made.
        attempts: usize,
        /// Last summarizer error.
        reason: String,
    },

    /// A query did not complete before its deadline.
    #[error("retrieval timed out after {0:?}")]
    RetrievalTimeout(Duration),

    /// A tree build exceeded its overall deadline (plus grace period).
    #[error("tree build exceeded its deadline of {0:?}")]
    BuildTimeout(Duration),

    /// Level ordering, child references or embedding dimensions are inconsistent.
    #[error("tree inconsistent: {0}")]
    TreeInconsistent(String),

    /// Vector dimension mismatch.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Found dimension.
        found: usize,
    },

    /// Invalid configuration value.
    #[error("invalid configuration '{name}': {message}")]
    InvalidConfig {
        /// Option name.
        name: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// A storage call did not complete in time.
    #[error("storage call timed out after {0:?}")]
    StorageTimeout(Duration),

    /// The storage collaborator reported an error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Shorthand for [`Error::EmbeddingUnavailable`].
    pub fn embedding_unavailable(reason: impl Into<String>) -> Self {
        Error::EmbeddingUnavailable {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::InvalidConfig`].
    pub fn invalid_config(name: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            name,
            message: message.into(),
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    ///
    /// Structural errors (dimension mismatch, inconsistent trees, bad config)
    /// indicate a data or configuration problem and are never retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::EmbeddingUnavailable { .. }
                | Error::RetrievalTimeout(_)
                | Error::BuildTimeout(_)
                | Error::StorageTimeout(_)
        )
    }
}
