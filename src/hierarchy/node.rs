//! Chunks and tree nodes.

use core::fmt;
use std::collections::BTreeMap;

use crate::embed::{estimate_tokens, EmbeddingVector};

/// A unit of source text handed over by the chunker. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Stable id, unique within a collection.
    pub id: String,
    /// Owning document.
    pub document_id: String,
    /// Raw text.
    pub text: String,
    /// Position of the chunk in its document.
    pub ordinal: u32,
    /// Free-form metadata from the chunker.
    pub metadata: BTreeMap<String, String>,
}

impl Chunk {
    /// Create a chunk without metadata.
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        text: impl Into<String>,
        ordinal: u32,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            text: text.into(),
            ordinal,
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.metadata.insert(key.into(), value.into());
        self
    }

    /// Length of the text in bytes.
    pub fn byte_len(&self) -> usize {
        self.text.len()
    }

    /// Estimated token length of the text.
    pub fn token_len(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

/// How a node's text came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// An original chunk.
    Leaf,
    /// Summarizer output for a cluster.
    Summary,
    /// Truncated member text of a cluster whose summarization failed.
    PassThrough,
}

/// A node in a summary tree.
///
/// `children` index into the owning [`TreeSnapshot`](super::TreeSnapshot)'s
/// arena; a child shared by several clusters appears in several parents'
/// lists but exists once.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Node id (the chunk id for leaves).
    pub id: String,
    /// Depth in tree (0 = leaves).
    pub level: usize,
    /// Leaf, summary or pass-through.
    pub kind: NodeKind,
    /// Chunk text or summary text.
    pub text: String,
    /// Embedding of `text`.
    pub embedding: EmbeddingVector,
    /// Arena indices of child nodes, in cluster member order.
    pub children: Vec<usize>,
    /// Owning collection.
    pub collection: String,
    /// Chunk ordinal for leaves, minimum child ordinal otherwise.
    pub ordinal: u32,
    /// Owning document (leaves only).
    pub document_id: Option<String>,
    /// Chunk metadata (leaves only).
    pub metadata: BTreeMap<String, String>,
}

impl TreeNode {
    /// Create a leaf from a chunk and its embedding.
    pub fn leaf(collection: &str, chunk: Chunk, embedding: EmbeddingVector) -> Self {
        Self {
            embedding: embedding.with_owner(chunk.id.clone()),
            id: chunk.id,
            level: 0,
            kind: NodeKind::Leaf,
            text: chunk.text,
            children: Vec::new(),
            collection: collection.to_string(),
            ordinal: chunk.ordinal,
            document_id: Some(chunk.document_id),
            metadata: chunk.metadata,
        }
    }

    /// Create a summary or pass-through node.
    #[allow(clippy::too_many_arguments)]
    pub fn internal(
        collection: &str,
        id: String,
        level: usize,
        kind: NodeKind,
        text: String,
        embedding: EmbeddingVector,
        children: Vec<usize>,
        ordinal: u32,
    ) -> Self {
        Self {
            embedding: embedding.with_owner(id.clone()),
            id,
            level,
            kind,
            text,
            children,
            collection: collection.to_string(),
            ordinal,
            document_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Check if this is a leaf node.
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Estimated token length of the text.
    pub fn token_len(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

impl fmt::Display for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NodeKind::Leaf => write!(f, "Leaf[{}]: {}", self.id, self.text),
            NodeKind::Summary => write!(f, "Node[{}] L{}: {}", self.id, self.level, self.text),
            NodeKind::PassThrough => {
                write!(f, "Node[{}] L{} (pass-through): {}", self.id, self.level, self.text)
            }
        }
    }
}
