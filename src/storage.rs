//! Persistence of built trees.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::hierarchy::{TreeSnapshot, TreeVersion};

/// Node storage for whole trees.
///
/// `persist` replaces a collection's tree atomically: a concurrent `load`
/// returns either the previous tree or the new one, never a mix.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Store `snapshot` as the collection's current tree and assign its version.
    async fn persist(&self, snapshot: TreeSnapshot) -> Result<TreeVersion>;

    /// Current tree of a collection, if any.
    async fn load(&self, collection: &str) -> Result<Option<Arc<TreeSnapshot>>>;

    /// Drop a collection's tree; returns whether one existed.
    async fn delete(&self, collection: &str) -> Result<bool>;
}

/// Process-local store keeping every collection's tree behind an `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryTreeStore {
    trees: RwLock<HashMap<String, Arc<TreeSnapshot>>>,
}

impl InMemoryTreeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored collections.
    pub fn len(&self) -> usize {
        self.trees.read().len()
    }

    /// Whether no collection is stored.
    pub fn is_empty(&self) -> bool {
        self.trees.read().is_empty()
    }
}

#[async_trait]
impl TreeStore for InMemoryTreeStore {
    async fn persist(&self, snapshot: TreeSnapshot) -> Result<TreeVersion> {
        let collection = snapshot.collection().to_string();
        let mut trees = self.trees.write();
        let version = trees.get(&collection).map_or(1, |t| t.version() + 1);
        let _ = trees.insert(collection.clone(), Arc::new(snapshot.with_version(version)));
        Ok(TreeVersion {
            collection,
            version,
        })
    }

    async fn load(&self, collection: &str) -> Result<Option<Arc<TreeSnapshot>>> {
        Ok(self.trees.read().get(collection).cloned())
    }

    async fn delete(&self, collection: &str) -> Result<bool> {
        Ok(self.trees.write().remove(collection).is_some())
    }
}

/// Run a storage call under `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| Error::StorageTimeout(timeout))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used, unused_results)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versions_increase_per_collection() {
        let store = InMemoryTreeStore::new();
        let v1 = store.persist(TreeSnapshot::new("a", Vec::new())).await.unwrap();
        let v2 = store.persist(TreeSnapshot::new("a", Vec::new())).await.unwrap();
        let other = store.persist(TreeSnapshot::new("b", Vec::new())).await.unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(other.version, 1);
        assert_eq!(store.load("a").await.unwrap().unwrap().version(), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_old_snapshot_stays_readable_after_swap() {
        let store = InMemoryTreeStore::new();
        store.persist(TreeSnapshot::new("a", Vec::new())).await.unwrap();
        let held = store.load("a").await.unwrap().unwrap();
        store.persist(TreeSnapshot::new("a", Vec::new())).await.unwrap();

        assert_eq!(held.version(), 1);
        assert_eq!(store.load("a").await.unwrap().unwrap().version(), 2);
    }

    #[tokio::test]
    async fn test_missing_and_delete() {
        let store = InMemoryTreeStore::new();
        assert!(store.load("nope").await.unwrap().is_none());
        store.persist(TreeSnapshot::new("a", Vec::new())).await.unwrap();
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        };
        let err = with_timeout(Duration::from_secs(1), slow).await.unwrap_err();
        assert_eq!(err, Error::StorageTimeout(Duration::from_secs(1)));
    }
}
