//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointStore`] keeps one checkpoint per workflow id in an
//! `Arc<RwLock<HashMap>>`. Clones share the same storage, which is what lets a
//! test "crash" an engine, build a new one over the same store and resume.
//!
//! Data is lost when the process exits. Use
//! [`FileCheckpointStore`](crate::FileCheckpointStore) when workflows must survive
//! a restart.

use crate::{
    checkpoint::Checkpoint,
    error::Result,
    traits::{ensure_matches, CheckpointStore},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe in-memory checkpoint storage
type CheckpointStorage = Arc<RwLock<HashMap<String, Checkpoint>>>;

/// In-memory checkpoint store
///
/// # Example
///
/// ```rust
/// use stagegraph_checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryCheckpointStore::new();
///     store.save("order-1", Checkpoint::new("order-1", 0, json!({}))).await?;
///     assert!(store.load("order-1").await?.is_some());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    storage: CheckpointStorage,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workflows with a checkpoint
    pub async fn len(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.is_empty()
    }

    /// Drop every checkpoint (useful for testing)
    pub async fn clear_all(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, workflow_id: &str, checkpoint: Checkpoint) -> Result<()> {
        ensure_matches(workflow_id, &checkpoint)?;
        self.storage
            .write()
            .await
            .insert(workflow_id.to_string(), checkpoint);
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.storage.read().await.get(workflow_id).cloned())
    }

    async fn clear(&self, workflow_id: &str) -> Result<()> {
        self.storage.write().await.remove(workflow_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.storage.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn exists(&self, workflow_id: &str) -> Result<bool> {
        Ok(self.storage.read().await.contains_key(workflow_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointMetadata, CheckpointSource};
    use crate::error::CheckpointError;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        let checkpoint = Checkpoint::new("order-1", 1, json!({"status": "text_written"}))
            .with_metadata(CheckpointMetadata::new().with_source(CheckpointSource::Stage));

        store.save("order-1", checkpoint.clone()).await.unwrap();

        let loaded = store.load("order-1").await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn test_save_replaces_previous() {
        let store = InMemoryCheckpointStore::new();
        for step in 0..3 {
            store
                .save("order-1", Checkpoint::new("order-1", step, json!({"step": step})))
                .await
                .unwrap();
        }

        assert_eq!(store.len().await, 1);
        let loaded = store.load("order-1").await.unwrap().unwrap();
        assert_eq!(loaded.step, 2);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load("nope").await.unwrap().is_none());
        assert!(!store.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear() {
        let store = InMemoryCheckpointStore::new();
        store
            .save("a", Checkpoint::new("a", 0, json!({})))
            .await
            .unwrap();
        store.clear("a").await.unwrap();
        assert!(store.load("a").await.unwrap().is_none());

        // clearing twice is fine
        store.clear("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let store = InMemoryCheckpointStore::new();
        for id in ["c", "a", "b"] {
            store.save(id, Checkpoint::new(id, 0, json!({}))).await.unwrap();
        }
        assert_eq!(store.list().await.unwrap(), vec!["a", "b", "c"]);

        store.clear_all().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_rejects_mismatched_key() {
        let store = InMemoryCheckpointStore::new();
        let result = store.save("b", Checkpoint::new("a", 0, json!({}))).await;
        assert!(matches!(result, Err(CheckpointError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let store = InMemoryCheckpointStore::new();
        let other = store.clone();
        store.save("a", Checkpoint::new("a", 0, json!({}))).await.unwrap();
        assert!(other.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_distinct_ids() {
        let store = InMemoryCheckpointStore::new();
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("wf-{}", worker);
                for step in 0..25 {
                    store
                        .save(&id, Checkpoint::new(&id, step, json!({"worker": worker})))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len().await, 8);
        for worker in 0..8 {
            let id = format!("wf-{}", worker);
            let cp = store.load(&id).await.unwrap().unwrap();
            assert_eq!(cp.step, 24);
            assert_eq!(cp.state["worker"], worker);
        }
    }
}
