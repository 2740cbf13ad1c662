//! Per-file record of what the vector store currently holds.
//!
//! The manifest is the prior index state the change detector compares
//! against. It is saved after each batch's store writes and before the
//! checkpoint, so a record is never newer than the store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::checkpoint::write_atomic;
use crate::error::{IndexError, Result};
use crate::hasher::{digest_fields, ContentHash};

const MANIFEST_FILE_NAME: &str = "manifest.json";

/// What was indexed for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Repo-relative, `/`-separated path
    pub path: String,

    /// SHA256 of the file content
    pub content_hash: ContentHash,

    /// Commit the file was last indexed at, if history was available
    pub last_seen_commit: Option<String>,

    /// Modification time in unix milliseconds
    pub modification_time: u64,

    /// Stable identity of the file, carried across renames
    pub lineage: String,

    /// IDs of the entities currently stored for this file
    pub entity_ids: Vec<String>,

    /// Indexed bytes differed from the commit the index refers to (untracked,
    /// dirty or indexed while HEAD moved). A git diff from that commit cannot
    /// see later edits that restore it, so these paths are always re-checked.
    #[serde(default)]
    pub diverged: bool,
}

/// Derive the lineage for a file first indexed at `path`.
pub fn lineage_for(path: &str) -> String {
    digest_fields(&[b"lineage", path.as_bytes()])[..16].to_string()
}

/// Path-keyed file records, persisted as `manifest.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexManifest {
    pub version: u32,
    /// Bumped on every mutation.
    pub last_updated: Option<SystemTime>,
    pub files: BTreeMap<String, FileRecord>,
}

impl IndexManifest {
    pub fn new() -> Self {
        Self {
            version: 1,
            last_updated: None,
            files: BTreeMap::new(),
        }
    }

    /// Location of the manifest inside a state directory.
    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join(MANIFEST_FILE_NAME)
    }

    /// Load the manifest from `state_dir`; a missing file is an empty manifest.
    pub async fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::path_in(state_dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| IndexError::CheckpointCorrupt {
            path,
            reason: e.to_string(),
        })
    }

    /// Save the manifest to `state_dir` atomically.
    pub async fn save(&self, state_dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&Self::path_in(state_dir), &bytes).await?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True when the path is unknown or its content hash moved.
    pub fn needs_update(&self, path: &str, current_hash: &ContentHash) -> bool {
        match self.files.get(path) {
            Some(record) => &record.content_hash != current_hash,
            None => true,
        }
    }

    /// Insert or replace the record keyed by `record.path`.
    pub fn record_indexed(&mut self, record: FileRecord) {
        self.files.insert(record.path.clone(), record);
        self.last_updated = Some(SystemTime::now());
    }

    pub fn remove_file(&mut self, path: &str) -> Option<FileRecord> {
        let removed = self.files.remove(path);
        if removed.is_some() {
            self.last_updated = Some(SystemTime::now());
        }
        removed
    }

    /// Move a record to a new path. Lineage and entity ids move with it.
    pub fn rename_file(
        &mut self,
        old_path: &str,
        new_path: &str,
        last_seen_commit: Option<String>,
    ) -> Option<&FileRecord> {
        let mut record = self.files.remove(old_path)?;
        record.path = new_path.to_string();
        if last_seen_commit.is_some() {
            record.last_seen_commit = last_seen_commit;
        }
        self.files.insert(new_path.to_string(), record);
        self.last_updated = Some(SystemTime::now());
        self.files.get(new_path)
    }

    /// Paths whose record is flagged as diverged from the reference commit.
    pub fn diverged_paths(&self) -> Vec<String> {
        self.files
            .values()
            .filter(|r| r.diverged)
            .map(|r| r.path.clone())
            .collect()
    }

    pub fn set_diverged(&mut self, path: &str, diverged: bool) {
        if let Some(record) = self.files.get_mut(path) {
            record.diverged = diverged;
        }
    }

    /// Flag exactly the records listed in `diverged`, clearing the rest.
    /// Returns whether any flag changed.
    pub fn settle_divergence(&mut self, diverged: &BTreeSet<String>) -> bool {
        let mut changed = false;
        for record in self.files.values_mut() {
            let flag = diverged.contains(&record.path);
            if record.diverged != flag {
                record.diverged = flag;
                changed = true;
            }
        }
        if changed {
            self.last_updated = Some(SystemTime::now());
        }
        changed
    }

    /// Recorded paths absent from `current_files`.
    pub fn find_deleted_files(&self, current_files: &[String]) -> Vec<String> {
        let current_set: std::collections::HashSet<&str> =
            current_files.iter().map(String::as_str).collect();
        self.files
            .keys()
            .filter(|p| !current_set.contains(p.as_str()))
            .cloned()
            .collect()
    }

    /// Paths of all records with the given content hash.
    pub fn find_by_hash(&self, hash: &ContentHash) -> Vec<&str> {
        self.files
            .values()
            .filter(|r| &r.content_hash == hash)
            .map(|r| r.path.as_str())
            .collect()
    }

    /// Total number of entities across all records.
    pub fn total_entities(&self) -> usize {
        self.files.values().map(|r| r.entity_ids.len()).sum()
    }
}
