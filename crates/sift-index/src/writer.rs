//! Applies per-file updates to a [`VectorStore`].
//!
//! After any update the store's derived entries for a file are exactly the
//! entities the extractor currently reports for it. Upserts go before stale
//! deletions, so a crash between the two leaves extra entries that the next
//! run removes, never a gap.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::Entity;
use crate::store::{EmbeddedEntity, StoreError, VectorStore};

/// Entity-level counts of what a write did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStats {
    pub entities_added: usize,
    pub entities_removed: usize,
    pub entities_renamed: usize,
    pub entities_unchanged: usize,
}

impl WriteStats {
    pub fn merge(&mut self, other: WriteStats) {
        self.entities_added += other.entities_added;
        self.entities_removed += other.entities_removed;
        self.entities_renamed += other.entities_renamed;
        self.entities_unchanged += other.entities_unchanged;
    }
}

/// Split freshly extracted entities into those that must be embedded and
/// the number already stored under the same id.
pub fn partition_new(
    previous_ids: &BTreeSet<String>,
    entities: Vec<Entity>,
    force: bool,
) -> (Vec<Entity>, usize) {
    if force {
        return (entities, 0);
    }
    let total = entities.len();
    let fresh: Vec<Entity> = entities
        .into_iter()
        .filter(|e| !previous_ids.contains(&e.id))
        .collect();
    let unchanged = total - fresh.len();
    (fresh, unchanged)
}

/// Writes updates for one run.
pub struct IndexWriter<S: VectorStore> {
    store: Arc<S>,
}

impl<S: VectorStore> IndexWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Remove every derived entry of a deleted file.
    pub async fn delete_file(&self, path: &str) -> Result<WriteStats, StoreError> {
        let removed = self.store.delete_by_path(path).await?;
        debug!("Removed {} entities of deleted file {}", removed, path);
        Ok(WriteStats {
            entities_removed: removed,
            ..Default::default()
        })
    }

    /// Move entries of an unchanged file to its new path without re-embedding.
    ///
    /// If the target path already had entries (a file was moved over
    /// another), those are deleted first.
    pub async fn rename_file(
        &self,
        old_path: &str,
        new_path: &str,
        target_had_entries: bool,
    ) -> Result<WriteStats, StoreError> {
        let mut stats = WriteStats::default();
        if target_had_entries {
            stats.entities_removed += self.store.delete_by_path(new_path).await?;
        }
        stats.entities_renamed = self.store.update_path(old_path, new_path).await?;
        debug!(
            "Renamed {} -> {} ({} entities)",
            old_path, new_path, stats.entities_renamed
        );
        Ok(stats)
    }

    /// Bring a file's entries in line with its current entities.
    ///
    /// `previous_ids` is what the store held for the file (empty for a file
    /// without a record), `current_ids` every id the extractor reports now,
    /// and `embedded` the subset of those that needed new vectors.
    pub async fn update_file(
        &self,
        path: &str,
        previous_ids: &BTreeSet<String>,
        current_ids: &BTreeSet<String>,
        embedded: Vec<EmbeddedEntity>,
        has_record: bool,
    ) -> Result<WriteStats, StoreError> {
        let mut stats = WriteStats::default();

        if !has_record {
            // Entries without a record are leftovers of an interrupted write.
            stats.entities_removed += self.store.delete_by_path(path).await?;
        }

        stats.entities_added = embedded.len();
        self.store.upsert(embedded).await?;

        let stale: Vec<String> = previous_ids.difference(current_ids).cloned().collect();
        if !stale.is_empty() {
            stats.entities_removed += self.store.delete_ids(&stale).await?;
        }
        stats.entities_unchanged = previous_ids.intersection(current_ids).count();

        debug!(
            "Updated {}: +{} -{} ={}",
            path, stats.entities_added, stats.entities_removed, stats.entities_unchanged
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ChunkVariant, EntityKind, ExtractedEntity, Span};
    use crate::store::MemoryStore;

    fn entity(path: &str, name: &str, body: &str) -> Entity {
        let extracted = ExtractedEntity {
            kind: EntityKind::Function,
            name: name.to_string(),
            span: Span::new(1, 1),
            signature: None,
            scope: None,
            text: body.to_string(),
        };
        Entity::mint(path, "lineage", &extracted, ChunkVariant::Full)
    }

    fn embed(entities: &[Entity]) -> Vec<EmbeddedEntity> {
        entities
            .iter()
            .map(|e| EmbeddedEntity {
                entity: e.clone(),
                vector: vec![1.0],
            })
            .collect()
    }

    fn ids(entities: &[Entity]) -> BTreeSet<String> {
        entities.iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn test_partition_new_skips_known_ids() {
        let a = entity("a.py", "a", "def a(): 1");
        let b = entity("a.py", "b", "def b(): 1");
        let previous = ids(&[a.clone()]);

        let (fresh, unchanged) = partition_new(&previous, vec![a.clone(), b.clone()], false);
        assert_eq!(fresh, vec![b.clone()]);
        assert_eq!(unchanged, 1);

        let (forced, unchanged) = partition_new(&previous, vec![a, b], true);
        assert_eq!(forced.len(), 2);
        assert_eq!(unchanged, 0);
    }

    #[tokio::test]
    async fn test_update_replaces_stale_entities() {
        let store = Arc::new(MemoryStore::new());
        let writer = IndexWriter::new(store.clone());

        let a = entity("m.py", "a", "def a(): 1");
        let b = entity("m.py", "b", "def b(): 1");
        let stats = writer
            .update_file("m.py", &BTreeSet::new(), &ids(&[a.clone(), b.clone()]), embed(&[a.clone(), b.clone()]), false)
            .await
            .unwrap();
        assert_eq!(stats.entities_added, 2);

        // b changes, a stays
        let b2 = entity("m.py", "b", "def b(): 2");
        let previous = ids(&[a.clone(), b.clone()]);
        let current = ids(&[a.clone(), b2.clone()]);
        let stats = writer
            .update_file("m.py", &previous, &current, embed(&[b2.clone()]), true)
            .await
            .unwrap();
        assert_eq!(stats.entities_added, 1);
        assert_eq!(stats.entities_removed, 1);
        assert_eq!(stats.entities_unchanged, 1);
        assert_eq!(store.ids_for_path("m.py").await, current);
    }

    #[tokio::test]
    async fn test_new_file_clears_orphans() {
        let store = Arc::new(MemoryStore::new());
        let writer = IndexWriter::new(store.clone());
        let orphan = entity("n.py", "old", "def old(): 1");
        store.upsert(embed(&[orphan])).await.unwrap();

        let fresh = entity("n.py", "new", "def new(): 1");
        let stats = writer
            .update_file("n.py", &BTreeSet::new(), &ids(&[fresh.clone()]), embed(&[fresh.clone()]), false)
            .await
            .unwrap();
        assert_eq!(stats.entities_removed, 1);
        assert_eq!(store.ids_for_path("n.py").await, ids(&[fresh]));
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let store = Arc::new(MemoryStore::new());
        let writer = IndexWriter::new(store.clone());
        let a = entity("old.py", "a", "def a(): 1");
        let squatter = entity("new.py", "s", "def s(): 1");
        store.upsert(embed(&[a.clone(), squatter])).await.unwrap();

        let stats = writer.rename_file("old.py", "new.py", true).await.unwrap();
        assert_eq!(stats.entities_renamed, 1);
        assert_eq!(stats.entities_removed, 1);
        assert_eq!(store.ids_for_path("new.py").await, ids(&[a]));
        assert!(store.ids_for_path("old.py").await.is_empty());

        let stats = writer.delete_file("new.py").await.unwrap();
        assert_eq!(stats.entities_removed, 1);
        assert!(store.is_empty().await);
    }
}
