//! Hierarchical summary trees for multi-resolution retrieval.
//!
//! # The Core Insight
//!
//! Information exists at multiple scales. A single question might need:
//!
//! ```text
//! Question                        │ Scale Needed
//! ────────────────────────────────┼──────────────────────
//! "What year was X founded?"      │ Single chunk
//! "Summarize the main themes"     │ Document-level summary
//! "How does A relate to B?"       │ Cross-section synthesis
//! ```
//!
//! A RAPTOR tree stores all of these at once:
//!
//! ```text
//! Level 2:        [Root Summary]
//!                 /             \
//! Level 1:  [Summary A]      [Summary B]
//!           /    |    \      /    |    \
//! Level 0: c1   c2    c3    c3   c4    c5     (c3 in two clusters)
//! ```
//!
//! Soft clustering lets a chunk feed several summaries. Nodes live once in
//! an arena ([`TreeSnapshot`]) and parents refer to children by index.
//!
//! # Modules
//!
//! - [`TreeBuilder`]: the level-by-level build loop
//! - [`TreeSnapshot`]: the immutable built tree retrieval reads
//! - [`HealthCheck`]: structural validation run before a tree is persisted
//!
//! # References
//!
//! - Sarthi et al. (2024). "RAPTOR: Recursive Abstractive Processing for
//!   Tree-Organized Retrieval." ICLR.

mod node;
mod raptor;
mod snapshot;
mod validate;

pub use node::{Chunk, NodeKind, TreeNode};
pub use raptor::{BuildReport, TreeBuilder, TreeVersion};
pub use snapshot::TreeSnapshot;
pub use validate::{
    ensure_consistent, HealthCheck, HealthReport, Severity, ValidationIssue, ValidationReport,
};
