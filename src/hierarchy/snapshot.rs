//! Immutable, versioned view of one collection's tree.

use std::time::SystemTime;

use super::node::TreeNode;

/// A built tree: node arena plus per-level index.
///
/// Retrieval reads snapshots through an `Arc`, so a rebuild never mutates a
/// tree a query is scanning. Unit-length copies of every embedding are kept
/// alongside the arena so cosine similarity is a dot product.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    collection: String,
    version: u64,
    nodes: Vec<TreeNode>,
    levels: Vec<Vec<usize>>,
    unit: Vec<Vec<f32>>,
    built_at: SystemTime,
}

impl TreeSnapshot {
    /// Index `nodes` by level. The version starts at 0 until a store assigns one.
    pub fn new(collection: impl Into<String>, nodes: Vec<TreeNode>) -> Self {
        let depth = nodes.iter().map(|n| n.level + 1).max().unwrap_or(0);
        let mut levels = vec![Vec::new(); depth];
        for (i, node) in nodes.iter().enumerate() {
            levels[node.level].push(i);
        }
        let unit = nodes
            .iter()
            .map(|n| normalized(n.embedding.values()))
            .collect();
        Self {
            collection: collection.into(),
            version: 0,
            nodes,
            levels,
            unit,
            built_at: SystemTime::now(),
        }
    }

    /// Copy with a store-assigned version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Owning collection.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Store-assigned build number.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When the snapshot was assembled.
    pub fn built_at(&self) -> SystemTime {
        self.built_at
    }

    /// Get a node by arena index.
    pub fn get_node(&self, idx: usize) -> Option<&TreeNode> {
        self.nodes.get(idx)
    }

    /// Unit-length embedding of a node.
    pub fn unit_vector(&self, idx: usize) -> Option<&[f32]> {
        self.unit.get(idx).map(Vec::as_slice)
    }

    /// Arena indices of all nodes at a level.
    pub fn level_indices(&self, level: usize) -> &[usize] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Get all nodes at a specific level.
    pub fn get_level(&self, level: usize) -> Option<Vec<&TreeNode>> {
        self.levels
            .get(level)
            .map(|ids| ids.iter().filter_map(|&id| self.nodes.get(id)).collect())
    }

    /// Get the number of levels in the tree.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Node count per level, leaves first.
    pub fn level_sizes(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    /// Get all leaf nodes.
    pub fn leaves(&self) -> Vec<&TreeNode> {
        self.get_level(0).unwrap_or_default()
    }

    /// Get the root nodes (highest level).
    pub fn roots(&self) -> Vec<&TreeNode> {
        self.get_level(self.depth().saturating_sub(1))
            .unwrap_or_default()
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if tree is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over all nodes in arena order.
    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter()
    }

    /// Model tag shared by the tree's embeddings.
    pub fn model(&self) -> Option<&str> {
        self.nodes.first().map(|n| n.embedding.model())
    }

    /// Embedding dimension shared by the tree's nodes.
    pub fn dimension(&self) -> Option<usize> {
        self.nodes.first().map(|n| n.embedding.dimension())
    }
}

fn normalized(values: &[f32]) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        values.iter().map(|x| x / norm).collect()
    } else {
        values.to_vec()
    }
}
