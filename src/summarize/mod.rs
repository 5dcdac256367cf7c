//! Summarization of clusters into parent-node text.
//!
//! The actual summarization logic (an LLM call, typically) is provided by the
//! user through the [`Summarizer`] trait. Its contract:
//!
//! - [`SummarizeError::Transient`] is retried with capped exponential
//!   backoff, up to the configured attempt budget.
//! - [`SummarizeError::Permanent`] is not retried.
//! - Either way, a cluster whose summarization ultimately fails becomes a
//!   pass-through node carrying the truncated member text; the build goes on.

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::config::BuildConfig;
use crate::error::Error;

/// Characters per token assumed when truncating to a token budget.
pub const CHARS_PER_TOKEN: usize = 4;

/// Context passed with every summarization call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRequest {
    /// Level the summary node will sit on.
    pub level: usize,
    /// Cluster index within that level.
    pub cluster: usize,
    /// Output length limit, in tokens.
    pub max_tokens: usize,
}

/// Failure reported by a summarizer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SummarizeError {
    /// May succeed if retried (timeouts, overloaded model).
    #[error("transient summarizer error: {0}")]
    Transient(String),
    /// Will not succeed on retry (content rejected, bad request).
    #[error("permanent summarizer error: {0}")]
    Permanent(String),
}

/// Condenses the texts of one cluster into a summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `texts` (already truncated to the input budget).
    async fn summarize(
        &self,
        texts: &[String],
        request: &SummaryRequest,
    ) -> Result<String, SummarizeError>;
}

/// A simple concatenation summarizer (for testing).
#[derive(Debug, Clone)]
pub struct ConcatSummarizer {
    /// Separator between items.
    pub separator: String,
    /// Maximum length in characters (truncate if exceeded).
    pub max_len: Option<usize>,
}

impl ConcatSummarizer {
    /// Create a new concatenation summarizer.
    pub fn new() -> Self {
        Self {
            separator: " | ".to_string(),
            max_len: None,
        }
    }

    /// Set separator.
    pub fn with_separator(mut self, sep: impl Into<String>) -> Self {
        self.separator = sep.into();
        self
    }

    /// Set maximum length.
    pub fn with_max_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }
}

impl Default for ConcatSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summarizer for ConcatSummarizer {
    async fn summarize(
        &self,
        texts: &[String],
        _request: &SummaryRequest,
    ) -> Result<String, SummarizeError> {
        let joined = texts.join(&self.separator);
        match self.max_len {
            Some(max) if joined.chars().count() > max => {
                let mut truncated = truncate_chars(&joined, max.saturating_sub(3)).to_string();
                truncated.push_str("...");
                Ok(truncated)
            }
            _ => Ok(joined),
        }
    }
}

/// A function-based summarizer.
#[derive(Clone)]
pub struct FnSummarizer<F> {
    f: F,
}

impl<F> FnSummarizer<F> {
    /// Create a summarizer from a function.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Summarizer for FnSummarizer<F>
where
    F: Fn(&[String], &SummaryRequest) -> Result<String, SummarizeError> + Send + Sync,
{
    async fn summarize(
        &self,
        texts: &[String],
        request: &SummaryRequest,
    ) -> Result<String, SummarizeError> {
        (self.f)(texts, request)
    }
}

/// Create a summarizer from a closure.
pub fn from_fn<F>(f: F) -> FnSummarizer<F>
where
    F: Fn(&[String], &SummaryRequest) -> Result<String, SummarizeError> + Send + Sync,
{
    FnSummarizer::new(f)
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// Keep whole member texts in order until `token_budget` is spent; the text
/// that crosses the budget is cut at a character boundary.
pub fn truncate_to_budget(texts: &[String], token_budget: usize) -> Vec<String> {
    let mut remaining = token_budget.saturating_mul(CHARS_PER_TOKEN);
    let mut out = Vec::with_capacity(texts.len());
    for text in texts {
        if remaining == 0 {
            break;
        }
        let len = text.chars().count();
        if len <= remaining {
            out.push(text.clone());
            remaining -= len;
        } else {
            out.push(truncate_chars(text, remaining).to_string());
            remaining = 0;
        }
    }
    out
}

/// Text of a pass-through node: the truncated member texts, joined.
pub fn pass_through_text(texts: &[String]) -> String {
    texts.join("\n\n")
}

/// Call `summarizer` with capped exponential backoff and jitter.
///
/// Returns [`Error::SummarizationFailed`] once the attempt budget is spent or
/// on a permanent error.
pub async fn summarize_with_retry(
    summarizer: &dyn Summarizer,
    texts: &[String],
    request: &SummaryRequest,
    config: &BuildConfig,
) -> Result<String, Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match summarizer.summarize(texts, request).await {
            Ok(summary) => return Ok(summary),
            Err(SummarizeError::Transient(reason)) if attempt < config.summary_max_attempts => {
                let base = config.backoff(attempt);
                let jitter = rand::rng().random_range(0..=base.as_millis() as u64 / 4);
                let delay = base + std::time::Duration::from_millis(jitter);
                debug!(cluster = request.cluster, attempt, ?delay, %reason, "retrying summarization");
                tokio::time::sleep(delay).await;
            }
            Err(SummarizeError::Transient(reason)) | Err(SummarizeError::Permanent(reason)) => {
                return Err(Error::SummarizationFailed {
                    cluster: request.cluster,
                    attempts: attempt,
                    reason,
                });
            }
        }
    }
}
