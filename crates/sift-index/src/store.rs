//! Vector store boundary and the in-memory store.
//!
//! Every mutating operation only touches entries with [`Origin::Derived`].
//! Curated entries are written by other tools and survive deletions, renames
//! and re-indexing of the file they point at.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::entity::Entity;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store rejected write: {0}")]
    Rejected(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Who produced a stored entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Derived,
    Curated,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Derived => "derived",
            Self::Curated => "curated",
        }
    }
}

/// An entity with its vector, ready to write.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedEntity {
    pub entity: Entity,
    pub vector: Vec<f32>,
}

/// What a store holds for one id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub entity: Entity,
    pub vector: Vec<f32>,
    pub origin: Origin,
}

/// Target of index writes. Upserts are keyed by entity id and idempotent.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace derived entries by id.
    async fn upsert(&self, entities: Vec<EmbeddedEntity>) -> Result<(), StoreError>;

    /// Delete every derived entry whose file path matches; returns the count.
    async fn delete_by_path(&self, file_path: &str) -> Result<usize, StoreError>;

    /// Delete derived entries by id; returns the count.
    async fn delete_ids(&self, ids: &[String]) -> Result<usize, StoreError>;

    /// Point every derived entry of `old_path` at `new_path` without
    /// re-embedding; returns the count.
    async fn update_path(&self, old_path: &str, new_path: &str) -> Result<usize, StoreError>;

    /// Number of derived entries for a file.
    async fn count_for_path(&self, file_path: &str) -> Result<usize, StoreError>;
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredEntity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry owned by another tool.
    pub async fn insert_curated(&self, entity: Entity, vector: Vec<f32>) {
        self.entries.write().await.insert(
            entity.id.clone(),
            StoredEntity {
                entity,
                vector,
                origin: Origin::Curated,
            },
        );
    }

    /// Ordered copy of every entry.
    pub async fn snapshot(&self) -> BTreeMap<String, StoredEntity> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    /// Ids of derived entries for a file.
    pub async fn ids_for_path(&self, file_path: &str) -> BTreeSet<String> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.origin == Origin::Derived && e.entity.file_path == file_path)
            .map(|e| e.entity.id.clone())
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<StoredEntity> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert(&self, entities: Vec<EmbeddedEntity>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        for EmbeddedEntity { entity, vector } in entities {
            if matches!(entries.get(&entity.id), Some(e) if e.origin == Origin::Curated) {
                warn!("Not overwriting curated entry {}", entity.id);
                continue;
            }
            entries.insert(
                entity.id.clone(),
                StoredEntity {
                    entity,
                    vector,
                    origin: Origin::Derived,
                },
            );
        }
        Ok(())
    }

    async fn delete_by_path(&self, file_path: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.origin == Origin::Curated || e.entity.file_path != file_path);
        let removed = before - entries.len();
        debug!("Deleted {} entries for {}", removed, file_path);
        Ok(removed)
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for id in ids {
            if matches!(entries.get(id), Some(e) if e.origin == Origin::Derived) {
                entries.remove(id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn update_path(&self, old_path: &str, new_path: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let mut updated = 0;
        for entry in entries.values_mut() {
            if entry.origin == Origin::Derived && entry.entity.file_path == old_path {
                entry.entity.file_path = new_path.to_string();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_for_path(&self, file_path: &str) -> Result<usize, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.origin == Origin::Derived && e.entity.file_path == file_path)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ChunkVariant, EntityKind, ExtractedEntity, Span};

    fn embedded(path: &str, name: &str) -> EmbeddedEntity {
        let extracted = ExtractedEntity {
            kind: EntityKind::Function,
            name: name.to_string(),
            span: Span::new(1, 1),
            signature: None,
            scope: None,
            text: format!("def {}(): pass", name),
        };
        EmbeddedEntity {
            entity: Entity::mint(path, path, &extracted, ChunkVariant::Full),
            vector: vec![1.0, 0.0],
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        store.upsert(vec![embedded("a.py", "a")]).await.unwrap();
        store.upsert(vec![embedded("a.py", "a")]).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.count_for_path("a.py").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_path_spares_curated_and_other_files() {
        let store = MemoryStore::new();
        store
            .upsert(vec![embedded("a.py", "a"), embedded("a.py", "b"), embedded("b.py", "c")])
            .await
            .unwrap();
        let curated = embedded("a.py", "note");
        store.insert_curated(curated.entity.clone(), curated.vector).await;

        assert_eq!(store.delete_by_path("a.py").await.unwrap(), 2);
        assert_eq!(store.len().await, 2);
        assert!(store.get(&curated.entity.id).await.is_some());
        assert_eq!(store.count_for_path("b.py").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_path_moves_derived_only() {
        let store = MemoryStore::new();
        let e = embedded("old.py", "f");
        store.upsert(vec![e.clone()]).await.unwrap();
        let curated = embedded("old.py", "pinned");
        store.insert_curated(curated.entity.clone(), curated.vector).await;

        assert_eq!(store.update_path("old.py", "new.py").await.unwrap(), 1);
        let moved = store.get(&e.entity.id).await.unwrap();
        assert_eq!(moved.entity.file_path, "new.py");
        assert_eq!(moved.vector, e.vector);
        assert_eq!(
            store.get(&curated.entity.id).await.unwrap().entity.file_path,
            "old.py"
        );
    }

    #[tokio::test]
    async fn test_delete_ids_and_curated_overwrite() {
        let store = MemoryStore::new();
        let a = embedded("a.py", "a");
        let b = embedded("a.py", "b");
        store.upsert(vec![a.clone(), b.clone()]).await.unwrap();

        let removed = store
            .delete_ids(&[a.entity.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.ids_for_path("a.py").await, BTreeSet::from([b.entity.id.clone()]));

        // Upsert never replaces a curated entry with the same id
        store.insert_curated(a.entity.clone(), vec![9.0, 9.0]).await;
        store.upsert(vec![a.clone()]).await.unwrap();
        let kept = store.get(&a.entity.id).await.unwrap();
        assert_eq!(kept.origin, Origin::Curated);
        assert_eq!(kept.vector, vec![9.0, 9.0]);
    }
}
