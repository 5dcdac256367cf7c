//! Ranking tree nodes for a query.
//!
//! Retrieval scans the "collapsed" tree: leaves and summaries at every level
//! compete in one ranking. Each candidate gets a blended score
//!
//! ```text
//! score = (w_sim · cos(q, n) + w_lex · overlap(q, n) + w_ord · proximity(n)) / Σw
//! ```
//!
//! where `overlap` is the fraction of query keywords found in the node text
//! and `proximity = max(0, 1 - |ordinal - anchor| / horizon)`. A signal that
//! does not apply to a query (no keywords, no anchor) drops out of both the
//! numerator and the weight sum.

mod cache;
mod engine;
pub mod text;

pub use cache::{CacheKey, CacheStats, ResultCache};
pub use engine::RetrievalEngine;

use std::time::Duration;

use crate::hierarchy::NodeKind;

/// Which tree levels a query may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelFilter {
    /// Every level.
    #[default]
    All,
    /// Level 0 only.
    LeavesOnly,
    /// A single level.
    Exact(usize),
    /// Levels `min..=max`.
    Range(usize, usize),
}

impl LevelFilter {
    /// Whether `level` passes the filter.
    pub fn accepts(&self, level: usize) -> bool {
        match *self {
            LevelFilter::All => true,
            LevelFilter::LeavesOnly => level == 0,
            LevelFilter::Exact(l) => level == l,
            LevelFilter::Range(lo, hi) => (lo..=hi).contains(&level),
        }
    }
}

/// Per-query options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrieveOptions {
    /// Level filter.
    pub levels: LevelFilter,
    /// Results scoring below this are dropped.
    pub min_score: Option<f32>,
    /// Tenant scope; part of the cache key.
    pub tenant: Option<String>,
    /// Ordinal the proximity signal is measured from.
    pub anchor_ordinal: Option<u32>,
    /// Stop adding results once their estimated tokens would exceed this.
    pub token_budget: Option<usize>,
    /// Overrides the configured query deadline.
    pub deadline: Option<Duration>,
}

impl RetrieveOptions {
    /// Set the level filter.
    pub fn with_levels(mut self, levels: LevelFilter) -> Self {
        self.levels = levels;
        self
    }

    /// Set the score floor.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    /// Set the tenant.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Set the ordinal anchor.
    pub fn with_anchor(mut self, ordinal: u32) -> Self {
        self.anchor_ordinal = Some(ordinal);
        self
    }

    /// Set the token budget.
    pub fn with_token_budget(mut self, tokens: usize) -> Self {
        self.token_budget = Some(tokens);
        self
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode {
    /// Node id.
    pub id: String,
    /// Arena index in the tree the result came from.
    pub index: usize,
    /// Tree level.
    pub level: usize,
    /// Leaf, summary or pass-through.
    pub kind: NodeKind,
    /// Node text.
    pub text: String,
    /// Node ordinal.
    pub ordinal: u32,
    /// Owning document (leaves only).
    pub document_id: Option<String>,
    /// Blended score.
    pub score: f32,
    /// Cosine similarity to the query.
    pub similarity: f32,
    /// Keyword overlap with the query.
    pub lexical: f32,
    /// Ordinal proximity to the anchor.
    pub proximity: f32,
}
