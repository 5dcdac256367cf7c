//! # raptree
//!
//! RAPTOR-style hierarchical summary trees for retrieval.
//!
//! A corpus of text chunks becomes a tree: leaves are the chunks, every level
//! above holds LLM summaries of soft clusters of the level below. Queries are
//! ranked against all levels at once, so a broad question can land on a
//! summary while a narrow one lands on a leaf.
//!
//! ```text
//!   chunks ─► embed ─► cluster (BIC) ─► summarize ─► embed ─► ... ─► store
//!                                                                   │
//!   query  ─► embed ─► score every level (cosine + lexical + ordinal) ◄┘
//! ```
//!
//! | Module | Role |
//! |--------|------|
//! | [`embed`] | Embedding dispatch over rate-limited credentials |
//! | [`cluster`] | Random projection + diagonal GMM, K chosen by BIC |
//! | [`hierarchy`] | Tree data model, level-by-level builder, validation |
//! | [`retrieval`] | Blended scoring, early termination, result cache |
//! | [`summarize`] | Summarizer trait and retry policy |
//! | [`storage`] | Tree persistence trait and in-memory store |
//! | [`index`] | [`RaptorIndex`], the entry point wiring all of the above |
//!
//! The library emits `tracing` events and never installs a subscriber.

pub mod cluster;
pub mod config;
pub mod embed;
/// Error types used across `raptree`.
pub mod error;
pub mod hierarchy;
pub mod index;
pub mod retrieval;
pub mod storage;
pub mod summarize;

pub use config::RaptorConfig;
pub use error::{Error, Result};
pub use index::RaptorIndex;

pub use cluster::{Assignment, ClusterSelector, Clustering};
pub use embed::{EmbedBackend, EmbedKind, EmbeddingDispatcher, EmbeddingVector};
pub use hierarchy::{BuildReport, Chunk, NodeKind, TreeBuilder, TreeNode, TreeSnapshot, TreeVersion};
pub use retrieval::{LevelFilter, RetrievalEngine, RetrieveOptions, ScoredNode};
pub use storage::{InMemoryTreeStore, TreeStore};
pub use summarize::Summarizer;
