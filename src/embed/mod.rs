//! Text-to-vector dispatch over several rate-limited credentials.
//!
//! ```text
//! texts ──► batches (min(backend max, configured)) ──► buffered(concurrency)
//!                                                        │
//!             ┌──────────────────────────────────────────┘
//!             ▼
//!     pick slot: lowest window tokens → fewest in-flight → slot order
//!             │
//!     backend.embed(batch, kind, credential)
//!        ├─ Ok           → vectors (checked: count, dimension)
//!        ├─ RateLimited  → slot cools down, batch moves to next slot
//!        ├─ Transient    → backoff and retry (bounded)
//!        └─ Fatal        → slot disabled for the process lifetime
//! ```
//!
//! Chunk vectors are kept in an [`EmbedCache`] keyed by model, kind and
//! text fingerprint, so rebuilding over unchanged chunks skips the backend.
//!
//! The backend itself is a black box behind [`EmbedBackend`];
//! [`HashEmbedBackend`] is a deterministic offline implementation.

mod backend;
mod cache;
mod dispatcher;
mod hash;
mod slot;

pub use backend::{BackendError, EmbedBackend};
pub use cache::{EmbedCache, EmbedCacheKey};
pub use dispatcher::EmbeddingDispatcher;
pub use hash::HashEmbedBackend;
pub use slot::SlotStats;

use sha2::{Digest, Sha256};

/// What a text is being embedded as.
///
/// Some models embed queries and documents asymmetrically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbedKind {
    /// A retrieval query.
    Query,
    /// A chunk or summary stored in the tree.
    Chunk,
}

/// An embedding with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    owner: Option<String>,
    values: Vec<f32>,
    model: String,
    fingerprint: String,
}

impl EmbeddingVector {
    /// Wrap raw values computed for `text` by `model`.
    pub fn new(values: Vec<f32>, model: impl Into<String>, text: &str) -> Self {
        Self {
            owner: None,
            values,
            model: model.into(),
            fingerprint: fingerprint(text),
        }
    }

    /// Attach the owning chunk or node id.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Owning chunk or node id, if attached.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Vector components.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Model identity tag.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// SHA-256 hex digest of the embedded text.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Number of components.
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Vectors are comparable only if dimension and model agree.
    pub fn is_comparable(&self, other: &EmbeddingVector) -> bool {
        self.dimension() == other.dimension() && self.model == other.model
    }
}

/// SHA-256 hex digest of `text`.
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Rough token count used for usage accounting and input budgets.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}
