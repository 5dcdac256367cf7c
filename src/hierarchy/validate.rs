//! Structural checks run on every tree before it is persisted.
//!
//! - leaves sit on level 0 and have no children
//! - every other node has children, all of which exist
//! - `level = 1 + max(child level)`
//! - every node below the top level has at least one parent
//! - all embeddings share one model tag and one dimension
//! - node ids are unique
//!
//! A level that does not shrink the one below is reported as a warning:
//! the builder stops there, so it can only be the top level.

use std::collections::HashSet;
use std::fmt;

use super::snapshot::TreeSnapshot;
use crate::error::{Error, Result};

/// How bad an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Unusual shape, still servable.
    Warning,
    /// A broken invariant; the tree must not be persisted.
    Error,
}

/// One broken (or suspicious) tree property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// Two nodes share an id.
    DuplicateId { node: usize, id: String },
    /// Embedding model tag or dimension differs from the first node's.
    IncomparableEmbedding { node: usize, model: String, dimension: usize },
    /// Level 0 holds a non-leaf, or a leaf has children.
    MalformedLeaf { node: usize },
    /// A node above level 0 is a leaf or has no children.
    MalformedInternal { node: usize },
    /// A child index points outside the arena.
    MissingChild { node: usize, child: usize },
    /// `level != 1 + max(child level)`.
    LevelMismatch { node: usize, level: usize, max_child: usize },
    /// A node below the top level no summary refers to.
    Orphan { node: usize },
    /// A level with no nodes.
    EmptyLevel { level: usize },
    /// A level at least as large as the one below.
    NoShrink { level: usize, size: usize, below: usize },
}

impl ValidationIssue {
    /// Severity of this issue.
    pub fn severity(&self) -> Severity {
        match self {
            ValidationIssue::NoShrink { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Arena index of the node involved, if any.
    pub fn node(&self) -> Option<usize> {
        match *self {
            ValidationIssue::DuplicateId { node, .. }
            | ValidationIssue::IncomparableEmbedding { node, .. }
            | ValidationIssue::MalformedLeaf { node }
            | ValidationIssue::MalformedInternal { node }
            | ValidationIssue::MissingChild { node, .. }
            | ValidationIssue::LevelMismatch { node, .. }
            | ValidationIssue::Orphan { node } => Some(node),
            ValidationIssue::EmptyLevel { .. } | ValidationIssue::NoShrink { .. } => None,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::DuplicateId { node, id } => {
                write!(f, "node {node}: duplicate id '{id}'")
            }
            ValidationIssue::IncomparableEmbedding { node, model, dimension } => write!(
                f,
                "node {node}: embedding model or dimension differs ({dimension} dims of '{model}')"
            ),
            ValidationIssue::MalformedLeaf { node } => {
                write!(f, "node {node}: level 0 node must be a childless leaf")
            }
            ValidationIssue::MalformedInternal { node } => {
                write!(f, "node {node}: node above level 0 must be a summary with children")
            }
            ValidationIssue::MissingChild { node, child } => {
                write!(f, "node {node}: child {child} does not exist")
            }
            ValidationIssue::LevelMismatch { node, level, max_child } => write!(
                f,
                "node {node}: level {level} but highest child is on level {max_child}"
            ),
            ValidationIssue::Orphan { node } => {
                write!(f, "node {node}: below the top level but has no parent")
            }
            ValidationIssue::EmptyLevel { level } => write!(f, "level {level} is empty"),
            ValidationIssue::NoShrink { level, size, below } => {
                write!(f, "level {level} has {size} nodes, level below has {below}")
            }
        }
    }
}

/// All issues found in one tree.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Issues in discovery order.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// No error-level issue.
    pub fn is_healthy(&self) -> bool {
        self.issues.iter().all(|i| i.severity() < Severity::Error)
    }

    /// No issue at all.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Errors only.
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity() == Severity::Error)
    }

    /// The first error, as [`Error::TreeInconsistent`].
    pub fn into_result(self) -> Result<()> {
        match self.errors().next() {
            Some(issue) => Err(Error::TreeInconsistent(issue.to_string())),
            None => Ok(()),
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors = self.errors().count();
        write!(f, "{errors} errors, {} warnings", self.issues.len() - errors)?;
        for issue in &self.issues {
            write!(f, "\n  {issue}")?;
        }
        Ok(())
    }
}

/// Validation plus shape statistics.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Issues found.
    pub validation: ValidationReport,
    /// Total number of nodes.
    pub node_count: usize,
    /// Number of leaf nodes.
    pub leaf_count: usize,
    /// Highest level.
    pub max_level: usize,
    /// Average children per non-leaf node.
    pub avg_branching_factor: f64,
}

impl HealthReport {
    /// No error-level issue.
    pub fn is_healthy(&self) -> bool {
        self.validation.is_healthy()
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} nodes ({} leaves), top level {}, branching {:.2}; {}",
            self.node_count,
            self.leaf_count,
            self.max_level,
            self.avg_branching_factor,
            self.validation
        )
    }
}

/// Types whose structure can be checked.
pub trait HealthCheck {
    /// Run every check.
    fn health_check(&self) -> HealthReport;

    /// Shorthand for `health_check().is_healthy()`.
    fn is_healthy(&self) -> bool {
        self.health_check().is_healthy()
    }
}

impl HealthCheck for TreeSnapshot {
    fn health_check(&self) -> HealthReport {
        let mut validation = ValidationReport::default();
        let node_count = self.len();
        let mut has_parent = vec![false; node_count];
        let mut ids = HashSet::with_capacity(node_count);
        let model = self.model();
        let dimension = self.dimension();

        for (node_idx, node) in self.iter().enumerate() {
            if !ids.insert(node.id.as_str()) {
                validation.push(ValidationIssue::DuplicateId {
                    node: node_idx,
                    id: node.id.clone(),
                });
            }
            if Some(node.embedding.model()) != model
                || Some(node.embedding.dimension()) != dimension
            {
                validation.push(ValidationIssue::IncomparableEmbedding {
                    node: node_idx,
                    model: node.embedding.model().to_string(),
                    dimension: node.embedding.dimension(),
                });
            }

            if node.level == 0 {
                if !node.is_leaf() || !node.children.is_empty() {
                    validation.push(ValidationIssue::MalformedLeaf { node: node_idx });
                }
                continue;
            }
            if node.is_leaf() || node.children.is_empty() {
                validation.push(ValidationIssue::MalformedInternal { node: node_idx });
                if node.children.is_empty() {
                    continue;
                }
            }

            let mut max_child = None;
            for &child in &node.children {
                match self.get_node(child) {
                    Some(c) => {
                        has_parent[child] = true;
                        max_child = max_child.max(Some(c.level));
                    }
                    None => validation.push(ValidationIssue::MissingChild {
                        node: node_idx,
                        child,
                    }),
                }
            }
            if let Some(max_child) = max_child {
                if node.level != max_child + 1 {
                    validation.push(ValidationIssue::LevelMismatch {
                        node: node_idx,
                        level: node.level,
                        max_child,
                    });
                }
            }
        }

        let top = self.depth().saturating_sub(1);
        for (node_idx, node) in self.iter().enumerate() {
            if node.level < top && !has_parent[node_idx] {
                validation.push(ValidationIssue::Orphan { node: node_idx });
            }
        }

        let sizes = self.level_sizes();
        for (level, &size) in sizes.iter().enumerate() {
            if size == 0 {
                validation.push(ValidationIssue::EmptyLevel { level });
            }
            if level > 0 && size >= sizes[level - 1] {
                validation.push(ValidationIssue::NoShrink {
                    level,
                    size,
                    below: sizes[level - 1],
                });
            }
        }

        let leaf_count = self.level_indices(0).len();
        let internal = node_count - leaf_count;
        let avg_branching_factor = if internal == 0 {
            0.0
        } else {
            let total_children: usize = self.iter().map(|n| n.children.len()).sum();
            total_children as f64 / internal as f64
        };

        HealthReport {
            validation,
            node_count,
            leaf_count,
            max_level: top,
            avg_branching_factor,
        }
    }
}

/// Fail with [`Error::TreeInconsistent`] if the tree breaks an invariant.
pub fn ensure_consistent(tree: &TreeSnapshot) -> Result<()> {
    tree.health_check().validation.into_result()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, unused_results)]
mod tests {
    use super::*;
    use crate::embed::EmbeddingVector;
    use crate::hierarchy::{Chunk, NodeKind, TreeNode};
    use proptest::prelude::*;

    fn leaf(i: usize, dim: usize) -> TreeNode {
        TreeNode::leaf(
            "kb",
            Chunk::new(format!("c{i}"), "doc", format!("text {i}"), i as u32),
            EmbeddingVector::new(vec![1.0; dim], "m", "t"),
        )
    }

    fn summary(id: &str, level: usize, children: Vec<usize>) -> TreeNode {
        TreeNode::internal(
            "kb",
            id.into(),
            level,
            NodeKind::Summary,
            "s".into(),
            EmbeddingVector::new(vec![1.0; 2], "m", "s"),
            children,
            0,
        )
    }

    #[test]
    fn test_issue_display_names_node() {
        let issue = ValidationIssue::MissingChild { node: 42, child: 7 };
        assert_eq!(issue.severity(), Severity::Error);
        assert_eq!(issue.node(), Some(42));
        assert_eq!(issue.to_string(), "node 42: child 7 does not exist");

        let warn = ValidationIssue::NoShrink { level: 2, size: 3, below: 3 };
        assert_eq!(warn.severity(), Severity::Warning);
        assert_eq!(warn.node(), None);
    }

    #[test]
    fn test_valid_tree() {
        let tree = TreeSnapshot::new(
            "kb",
            vec![leaf(0, 2), leaf(1, 2), leaf(2, 2), summary("s0", 1, vec![0, 1, 2])],
        );
        let report = tree.health_check();
        assert!(report.is_healthy(), "{}", report);
        assert_eq!(report.leaf_count, 3);
        assert_eq!(report.max_level, 1);
        assert!((report.avg_branching_factor - 3.0).abs() < 1e-9);
        ensure_consistent(&tree).unwrap();
    }

    #[test]
    fn test_shared_child_is_fine() {
        let tree = TreeSnapshot::new(
            "kb",
            vec![
                leaf(0, 2),
                leaf(1, 2),
                leaf(2, 2),
                summary("s0", 1, vec![0, 1]),
                summary("s1", 1, vec![1, 2]),
            ],
        );
        assert!(tree.is_healthy());
    }

    #[test]
    fn test_level_violation() {
        let tree = TreeSnapshot::new(
            "kb",
            vec![leaf(0, 2), leaf(1, 2), summary("s0", 2, vec![0, 1])],
        );
        let err = ensure_consistent(&tree).unwrap_err();
        assert!(matches!(err, Error::TreeInconsistent(_)));
    }

    #[test]
    fn test_missing_child_and_orphan() {
        let tree = TreeSnapshot::new(
            "kb",
            vec![leaf(0, 2), leaf(1, 2), summary("s0", 1, vec![0, 9])],
        );
        let report = tree.health_check();
        assert!(!report.is_healthy());
        let issues = &report.validation.issues;
        assert!(issues.contains(&ValidationIssue::MissingChild { node: 2, child: 9 }));
        assert!(issues.contains(&ValidationIssue::Orphan { node: 1 }));
    }

    #[test]
    fn test_dimension_mismatch_detected() {
        let tree = TreeSnapshot::new("kb", vec![leaf(0, 2), leaf(1, 3)]);
        let err = ensure_consistent(&tree).unwrap_err();
        assert!(err.to_string().contains("dimension"));
    }

    #[test]
    fn test_duplicate_ids() {
        let tree = TreeSnapshot::new("kb", vec![leaf(0, 2), leaf(0, 2)]);
        assert!(!tree.is_healthy());
    }

    proptest! {
        #[test]
        fn prop_chunked_trees_are_healthy(
            n_leaves in 1usize..60,
            fanout in 2usize..8,
        ) {
            let mut nodes: Vec<TreeNode> = (0..n_leaves).map(|i| leaf(i, 2)).collect();
            let mut current: Vec<usize> = (0..n_leaves).collect();
            let mut level = 0;
            while current.len() > 1 {
                level += 1;
                let mut next = Vec::new();
                for (c, group) in current.chunks(fanout).enumerate() {
                    nodes.push(summary(&format!("L{level}C{c}"), level, group.to_vec()));
                    next.push(nodes.len() - 1);
                }
                current = next;
            }
            let tree = TreeSnapshot::new("kb", nodes);
            let report = tree.health_check();
            prop_assert!(report.is_healthy(), "{}", report);
        }
    }
}
