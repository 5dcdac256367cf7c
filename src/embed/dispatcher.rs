use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::backend::{BackendError, EmbedBackend};
use super::cache::{EmbedCache, EmbedCacheKey};
use super::slot::{CredentialSlot, SlotStats};
use super::{estimate_tokens, EmbedKind, EmbeddingVector};
use crate::config::DispatcherConfig;
use crate::error::{Error, Result};

/// Spreads embedding batches over credential slots.
///
/// Usage estimates live only in memory; a new dispatcher starts every slot at
/// `initial_usage_tokens`.
///
/// Chunk embeddings are cached by model and text fingerprint. Query
/// embeddings always reach the backend.
pub struct EmbeddingDispatcher {
    backend: Arc<dyn EmbedBackend>,
    slots: Vec<CredentialSlot>,
    cache: Option<EmbedCache>,
    config: DispatcherConfig,
    epoch: Instant,
    dimension: AtomicUsize,
}

impl std::fmt::Debug for EmbeddingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDispatcher")
            .field("model", &self.backend.model_id())
            .field("slots", &self.slots)
            .field("cache", &self.cache)
            .finish()
    }
}

impl EmbeddingDispatcher {
    /// Create a dispatcher with one slot per configured credential.
    pub fn new(backend: Arc<dyn EmbedBackend>, config: DispatcherConfig) -> Result<Self> {
        if config.credentials.is_empty() {
            return Err(Error::invalid_config(
                "dispatcher.credentials",
                "at least one required",
            ));
        }
        let slots = config
            .credentials
            .iter()
            .enumerate()
            .map(|(i, c)| CredentialSlot::new(i, c.clone(), config.initial_usage_tokens))
            .collect();
        let cache = (config.embed_cache_max_entries > 0)
            .then(|| EmbedCache::new(config.embed_cache_max_entries, config.embed_cache_ttl()));
        Ok(Self {
            backend,
            slots,
            cache,
            config,
            epoch: Instant::now(),
            dimension: AtomicUsize::new(0),
        })
    }

    /// Model identity of the backend.
    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    /// Snapshot of every slot, in configuration order.
    pub fn slot_stats(&self) -> Vec<SlotStats> {
        let now = self.now_ms();
        let window = self.window_ms();
        self.slots.iter().map(|s| s.stats(now, window)).collect()
    }

    /// `(hits, misses)` of the chunk embedding cache.
    pub fn cache_counters(&self) -> (u64, u64) {
        self.cache.as_ref().map_or((0, 0), EmbedCache::counters)
    }

    /// Embed `texts`, returning one vector per text in input order.
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    pub async fn embed(&self, texts: &[String], kind: EmbedKind) -> Result<Vec<EmbeddingVector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.backend.model_id();
        let cache = match kind {
            EmbedKind::Chunk => self.cache.as_ref(),
            EmbedKind::Query => None,
        };
        let cached: Vec<Option<Arc<Vec<f32>>>> = match cache {
            Some(cache) => texts
                .iter()
                .map(|t| cache.get(&EmbedCacheKey::new(model, kind, t)))
                .collect(),
            None => vec![None; texts.len()],
        };
        let missing: Vec<String> = texts
            .iter()
            .zip(&cached)
            .filter(|(_, hit)| hit.is_none())
            .map(|(t, _)| t.clone())
            .collect();
        debug!(cached = texts.len() - missing.len(), "embedding cache consulted");

        let fresh = self.embed_uncached(&missing, kind).await?;
        if let Some(cache) = cache {
            for (text, values) in missing.iter().zip(&fresh) {
                cache.insert(EmbedCacheKey::new(model, kind, text), values.clone());
            }
        }

        let mut fresh = fresh.into_iter();
        texts
            .iter()
            .zip(cached)
            .map(|(text, hit)| {
                let values = match hit {
                    Some(values) => values.as_ref().clone(),
                    None => fresh.next().ok_or(Error::DimensionMismatch {
                        expected: missing.len(),
                        found: 0,
                    })?,
                };
                Ok(EmbeddingVector::new(values, model, text))
            })
            .collect()
    }

    /// Send `texts` to the backend in concurrent batches, keeping input order.
    async fn embed_uncached(&self, texts: &[String], kind: EmbedKind) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batch_size = self
            .config
            .batch_size
            .min(self.backend.max_batch_size())
            .max(1);

        let calls: Vec<_> = texts
            .chunks(batch_size)
            .map(|batch| self.embed_batch(batch, kind))
            .collect();
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(calls)
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await?;
        Ok(batches.into_iter().flatten().collect())
    }

    async fn embed_batch(&self, batch: &[String], kind: EmbedKind) -> Result<Vec<Vec<f32>>> {
        let deadline = Instant::now() + self.config.per_call_deadline();
        let tokens: u64 = batch.iter().map(|t| estimate_tokens(t) as u64).sum();
        let mut transient_failures = 0usize;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::embedding_unavailable("per-call deadline exceeded"));
            }
            let slot = self.acquire(deadline).await?;
            slot.reserve(tokens);
            let outcome = tokio::time::timeout(
                self.config.request_timeout(),
                self.backend.embed(batch, kind, slot.credential()),
            )
            .await
            .unwrap_or_else(|_| Err(BackendError::Transient("request timed out".to_string())));
            slot.release();

            match outcome {
                Ok(vectors) => {
                    slot.record_success();
                    self.check_vectors(batch.len(), &vectors)?;
                    return Ok(vectors);
                }
                Err(BackendError::RateLimited { retry_after }) => {
                    let wait = self.config.cooldown(retry_after);
                    slot.cool_down(self.now_ms() + wait.as_millis() as u64);
                    warn!(slot = slot.index(), ?wait, "rate limited; moving batch to next slot");
                }
                Err(BackendError::Fatal(reason)) => {
                    if slot.disable() {
                        warn!(slot = slot.index(), %reason, "disabling credential");
                    }
                }
                Err(BackendError::Transient(reason)) => {
                    if slot.record_failure(self.config.max_consecutive_failures) {
                        warn!(slot = slot.index(), %reason, "disabling credential after repeated failures");
                    }
                    transient_failures += 1;
                    if transient_failures > self.config.max_retries {
                        return Err(Error::embedding_unavailable(reason));
                    }
                    let backoff = self.config.retry_backoff(transient_failures);
                    debug!(slot = slot.index(), attempt = transient_failures, ?backoff, %reason, "retrying batch");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Wait for the best usable slot, giving up if none frees before `deadline`.
    async fn acquire(&self, deadline: Instant) -> Result<&CredentialSlot> {
        loop {
            let now = self.now_ms();
            let window = self.window_ms();

            let best = self
                .slots
                .iter()
                .filter(|s| !s.is_disabled() && !s.is_cooling(now))
                .min_by_key(|s| (s.window_tokens(now, window), s.in_flight(), s.index()));
            if let Some(slot) = best {
                return Ok(slot);
            }

            let next_free = self
                .slots
                .iter()
                .filter(|s| !s.is_disabled())
                .map(CredentialSlot::cooldown_until)
                .min()
                .ok_or_else(|| Error::embedding_unavailable("all credentials disabled"))?;

            let wake = self.epoch + Duration::from_millis(next_free);
            if wake > deadline {
                return Err(Error::embedding_unavailable(
                    "all credentials cooling down past the call deadline",
                ));
            }
            debug!(wait_ms = next_free.saturating_sub(now), "all credentials cooling; waiting");
            tokio::time::sleep_until(wake).await;
        }
    }

    fn check_vectors(&self, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                found: vectors.len(),
            });
        }
        for v in vectors {
            let known = self.dimension.load(Ordering::Acquire);
            if known == 0 {
                let _ = self.dimension.compare_exchange(0, v.len(), Ordering::AcqRel, Ordering::Acquire);
            }
            let known = self.dimension.load(Ordering::Acquire);
            if v.len() != known || known == 0 {
                return Err(Error::DimensionMismatch {
                    expected: known,
                    found: v.len(),
                });
            }
        }
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn window_ms(&self) -> u64 {
        self.config.usage_window().as_millis() as u64
    }
}
