//! Durable run progress and the per-target run lock.
//!
//! A checkpoint is written after every completed batch, strictly after that
//! batch's store writes and manifest save. Writes go through a temp file that is
//! fsynced and renamed over the old checkpoint, so a crash leaves either the
//! previous or the new checkpoint on disk, never a torn one.
//!
//! Status transitions:
//!
//! ```text
//! NotStarted -> Running -> (Checkpointed)* -> Completed
//! Running | Checkpointed -> Failed   (kept on disk, resumable)
//! ```

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{IndexError, Result};

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";
const LOCK_FILE_NAME: &str = "index.lock";

/// Lifecycle of an indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Checkpointed,
    Completed,
    Failed,
}

impl RunStatus {
    /// A run in this state left work behind and is picked up by the next run.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Running | Self::Checkpointed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Checkpointed => "checkpointed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Persisted progress of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_id: String,
    pub status: RunStatus,
    /// Commit the index was last fully consistent with
    pub last_indexed_commit: Option<String>,
    /// Commit this run is bringing the index up to
    pub target_commit: Option<String>,
    /// Files whose updates are durable in the store
    pub processed_files: BTreeSet<String>,
    pub last_completed_batch_index: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Start a fresh run whose diff reference is `last_indexed_commit`.
    pub fn new_run(last_indexed_commit: Option<String>, target_commit: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_id: Uuid::new_v4().to_string(),
            status: RunStatus::NotStarted,
            last_indexed_commit,
            target_commit,
            processed_files: BTreeSet::new(),
            last_completed_batch_index: None,
            started_at: now,
            timestamp: now,
        }
    }

    pub fn begin(&mut self) {
        self.status = RunStatus::Running;
        self.timestamp = Utc::now();
    }

    /// Record a batch whose store writes have succeeded.
    pub fn record_batch<I>(&mut self, batch_index: u64, files: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.processed_files.extend(files);
        self.last_completed_batch_index = Some(batch_index);
        self.status = RunStatus::Checkpointed;
        self.timestamp = Utc::now();
    }

    /// Finish the run. The commit reference only advances when every file in
    /// the run made it into the store, otherwise the next run would not see
    /// the files that were left behind.
    pub fn complete(&mut self, advance_commit: bool) {
        if advance_commit {
            if let Some(target) = self.target_commit.clone() {
                self.last_indexed_commit = Some(target);
            }
        }
        self.status = RunStatus::Completed;
        self.timestamp = Utc::now();
    }

    pub fn fail(&mut self) {
        self.status = RunStatus::Failed;
        self.timestamp = Utc::now();
    }

    pub fn is_processed(&self, path: &str) -> bool {
        self.processed_files.contains(path)
    }

    /// Index the next batch of this run gets.
    pub fn next_batch_index(&self) -> u64 {
        self.last_completed_batch_index.map(|i| i + 1).unwrap_or(0)
    }
}

/// Reads and writes `<state_dir>/checkpoint.json`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(CHECKPOINT_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, `None` when no run has been recorded.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|e| IndexError::CheckpointCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(IndexError::CheckpointCorrupt {
                path: self.path.clone(),
                reason: format!("unknown schema version {}", checkpoint.schema_version),
            });
        }

        Ok(Some(checkpoint))
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&self.path, &bytes).await?;
        debug!(
            "Checkpoint saved: run={} status={} batch={:?}",
            checkpoint.run_id,
            checkpoint.status.as_str(),
            checkpoint.last_completed_batch_index
        );
        Ok(())
    }

    /// Delete the checkpoint. This is the manual recovery path for a
    /// corrupt checkpoint.
    pub async fn reset(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Removed checkpoint {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read the checkpoint of the index whose state lives in `state_dir`.
pub async fn read_checkpoint(state_dir: &Path) -> Result<Option<Checkpoint>> {
    CheckpointStore::new(state_dir).load().await
}

/// Exclusive, non-blocking `flock` on `<state_dir>/index.lock`, held for the
/// lifetime of a run and released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match try_lock(&file) {
            Ok(true) => {}
            Ok(false) => return Err(IndexError::LockConflict { path }),
            Err(e) => return Err(e.into()),
        }

        debug!("Acquired run lock {:?}", path);
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

/// `Ok(false)` when another handle holds the lock.
#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
}

// Without flock the open handle itself is the only guard.
#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

/// Write `bytes` to `path` through a synced temp file and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_starts_not_started() {
        let cp = Checkpoint::new_run(Some("abc".into()), Some("def".into()));
        assert_eq!(cp.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert_eq!(cp.status, RunStatus::NotStarted);
        assert_eq!(cp.next_batch_index(), 0);
        assert!(cp.processed_files.is_empty());
        assert!(Uuid::parse_str(&cp.run_id).is_ok());
    }

    #[test]
    fn test_state_transitions() {
        let mut cp = Checkpoint::new_run(Some("old".into()), Some("new".into()));
        cp.begin();
        assert_eq!(cp.status, RunStatus::Running);
        assert!(cp.status.is_resumable());

        cp.record_batch(0, vec!["a.py".to_string(), "b.py".to_string()]);
        assert_eq!(cp.status, RunStatus::Checkpointed);
        assert_eq!(cp.next_batch_index(), 1);
        assert!(cp.is_processed("a.py"));
        assert!(!cp.is_processed("c.py"));

        cp.record_batch(1, vec!["c.py".to_string()]);
        assert_eq!(cp.last_completed_batch_index, Some(1));

        cp.complete(true);
        assert_eq!(cp.status, RunStatus::Completed);
        assert!(!cp.status.is_resumable());
        assert_eq!(cp.last_indexed_commit.as_deref(), Some("new"));
    }

    #[test]
    fn test_complete_without_advance_keeps_reference() {
        let mut cp = Checkpoint::new_run(Some("old".into()), Some("new".into()));
        cp.begin();
        cp.complete(false);
        assert_eq!(cp.last_indexed_commit.as_deref(), Some("old"));
    }

    #[test]
    fn test_failed_is_resumable() {
        let mut cp = Checkpoint::new_run(None, None);
        cp.begin();
        cp.fail();
        assert_eq!(cp.status, RunStatus::Failed);
        assert!(cp.status.is_resumable());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());

        let mut cp = Checkpoint::new_run(None, Some("head".into()));
        cp.begin();
        cp.record_batch(0, vec!["src/a.rs".to_string()]);
        store.save(&cp).await.unwrap();

        let loaded = read_checkpoint(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, cp);
        assert!(!dir.path().join("checkpoint.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_status_is_snake_case_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut cp = Checkpoint::new_run(None, None);
        cp.begin();
        cp.record_batch(3, Vec::new());
        store.save(&cp).await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["status"], "checkpointed");
        assert_eq!(value["last_completed_batch_index"], 3);
    }

    #[tokio::test]
    async fn test_unparseable_checkpoint_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoint.json"), "{ not json").unwrap();

        let err = read_checkpoint(dir.path()).await.unwrap_err();
        assert!(matches!(err, IndexError::CheckpointCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_unknown_schema_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut cp = Checkpoint::new_run(None, None);
        cp.schema_version = 99;
        store.save(&cp).await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, IndexError::CheckpointCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_reset_removes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoint.json"), "garbage").unwrap();
        let store = CheckpointStore::new(dir.path());

        store.reset().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        // Resetting twice is fine
        store.reset().await.unwrap();
    }

    #[test]
    fn test_run_lock_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunLock::acquire(dir.path()).unwrap();

        let err = RunLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, IndexError::LockConflict { .. }));

        drop(first);
        assert!(RunLock::acquire(dir.path()).is_ok());
    }
}
