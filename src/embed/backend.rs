use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::EmbedKind;

/// Failure reported by an embedding backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The credential hit its rate limit (HTTP 429 or equivalent).
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Backend-supplied wait, if any.
        retry_after: Option<Duration>,
    },

    /// Server error, dropped connection or similar; worth retrying.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Invalid credential or request; the credential is not used again.
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

/// A remote (or local) embedding model.
#[async_trait]
pub trait EmbedBackend: Send + Sync {
    /// Model identity tag stamped on every vector.
    fn model_id(&self) -> &str;

    /// Largest batch the backend accepts in one request.
    fn max_batch_size(&self) -> usize;

    /// Embed `texts` with `credential`, one vector per text, in order.
    async fn embed(
        &self,
        texts: &[String],
        kind: EmbedKind,
        credential: &str,
    ) -> Result<Vec<Vec<f32>>, BackendError>;
}
