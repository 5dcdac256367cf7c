//! FNV-1a feature-hashing backend for tests and offline development.

use async_trait::async_trait;

use super::backend::{BackendError, EmbedBackend};
use super::EmbedKind;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001B3;

/// Deterministic character n-gram hashing embedder.
///
/// Ignores the credential and the embed kind. Identical texts (up to case)
/// map to identical unit vectors.
#[derive(Debug, Clone)]
pub struct HashEmbedBackend {
    dimension: usize,
    ngram_range: (usize, usize),
    model: String,
}

impl HashEmbedBackend {
    /// Create a backend producing `dimension`-wide vectors (at least 1).
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            ngram_range: (3, 4),
            model: format!("fnv1a-hash-{dimension}"),
        }
    }

    /// Set the character n-gram lengths hashed into the vector.
    pub fn with_ngram_range(mut self, min: usize, max: usize) -> Self {
        let min = min.max(1);
        self.ngram_range = (min, max.max(min));
        self
    }

    /// Output dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed one text.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let chars: Vec<char> = text.to_lowercase().chars().collect();
        for n in self.ngram_range.0..=self.ngram_range.1 {
            if n > chars.len() {
                continue;
            }
            for window in chars.windows(n) {
                let ngram: String = window.iter().collect();
                let h = fnv1a(ngram.as_bytes());
                let bucket = (h as usize) % self.dimension;
                let sign = if (h >> 32) & 1 == 0 { 1.0f32 } else { -1.0f32 };
                vector[bucket] += sign;
            }
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashEmbedBackend {
    fn default() -> Self {
        Self::new(128)
    }
}

#[async_trait]
impl EmbedBackend for HashEmbedBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        256
    }

    async fn embed(
        &self,
        texts: &[String],
        _kind: EmbedKind,
        _credential: &str,
    ) -> Result<Vec<Vec<f32>>, BackendError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
