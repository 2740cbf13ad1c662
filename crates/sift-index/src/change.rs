//! Change detection: what changed since the last indexed state.
//!
//! Git is used as a cheap candidate filter when a reference commit is known.
//! Every candidate is then confirmed against the manifest by content hash, so
//! a file whose bytes already match its record is never re-processed. Without
//! history the detector hashes every eligible file and compares against the
//! manifest directly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::git::{DiffEntry, GitRepo};
use crate::hasher::ContentHash;
use crate::manifest::IndexManifest;
use crate::scanner::{is_binary, FileFilter};

/// Files that changed, grouped by kind of change. Paths are repo-relative and
/// each list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    added: Vec<String>,
    modified: Vec<String>,
    deleted: Vec<String>,
    renamed: Vec<(String, String)>,
}

impl ChangeSet {
    pub fn new(
        added: Vec<String>,
        modified: Vec<String>,
        deleted: Vec<String>,
        renamed: Vec<(String, String)>,
    ) -> Self {
        fn sorted<T: Ord>(mut v: Vec<T>) -> Vec<T> {
            v.sort();
            v.dedup();
            v
        }
        Self {
            added: sorted(added),
            modified: sorted(modified),
            deleted: sorted(deleted),
            renamed: sorted(renamed),
        }
    }

    pub fn added(&self) -> &[String] {
        &self.added
    }

    pub fn modified(&self) -> &[String] {
        &self.modified
    }

    pub fn deleted(&self) -> &[String] {
        &self.deleted
    }

    pub fn renamed(&self) -> &[(String, String)] {
        &self.renamed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of changed paths (a rename counts once).
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len() + self.renamed.len()
    }

    /// Add `paths` as modification candidates unless they already appear
    /// somewhere in the set.
    fn with_rechecks(self, paths: Vec<String>) -> Self {
        let mentioned: BTreeSet<&str> = self
            .added
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .chain(self.renamed.iter().flat_map(|(from, to)| [from, to]))
            .map(String::as_str)
            .collect();
        let extra: Vec<String> = paths
            .into_iter()
            .filter(|p| !mentioned.contains(p.as_str()))
            .collect();
        if extra.is_empty() {
            return self;
        }
        debug!("re-checking {} paths indexed off the reference commit", extra.len());
        let mut modified = self.modified;
        modified.extend(extra);
        Self::new(self.added, modified, self.deleted, self.renamed)
    }
}

/// How the working tree relates to the HEAD commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadDivergence {
    /// Not a git checkout, or no commits yet
    NoHistory,
    /// Tracked changes (both ends of renames) plus untracked files
    Paths(BTreeSet<String>),
    /// git failed to answer; every path counts as diverged
    Unknown,
}

impl HeadDivergence {
    pub fn contains(&self, path: &str) -> bool {
        match self {
            Self::NoHistory => false,
            Self::Paths(paths) => paths.contains(path),
            Self::Unknown => true,
        }
    }
}

/// What the reference commit is compared against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffTarget {
    /// Working tree including untracked, non-ignored files
    #[default]
    WorkingTree,
    /// The HEAD commit
    Head,
    /// The index (`git diff --cached`)
    Staged,
    /// Changes on HEAD since it forked from the given branch
    BranchBase(String),
}

/// How a change set was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Git,
    HashFallback,
    FirstRun,
    Full,
    Supplied,
}

/// Result of change detection.
#[derive(Debug, Clone)]
pub struct Detection {
    pub changes: ChangeSet,
    pub source: DetectionSource,
    /// HEAD at detection time, when history is available
    pub head: Option<String>,
    /// Files that could not be read; left out of the change set
    pub skipped: Vec<String>,
}

/// State of a path on disk as far as indexing is concerned.
#[derive(Debug)]
enum DiskState {
    Missing,
    Excluded,
    Unreadable(std::io::Error),
    Present(ContentHash),
}

/// Produces change sets for one indexed root.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    root: PathBuf,
    filter: FileFilter,
    workers: usize,
}

impl ChangeDetector {
    pub fn new(root: &Path, filter: FileFilter, workers: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            filter,
            workers: workers.max(1),
        }
    }

    /// Detect changes since `reference`, preferring git and falling back to
    /// hash comparison when history or the reference is unavailable.
    pub async fn detect(
        &self,
        manifest: &IndexManifest,
        reference: Option<&str>,
        target: &DiffTarget,
    ) -> Result<Detection> {
        let repo = GitRepo::discover(&self.root).await;
        let head = match &repo {
            Some(repo) => repo.head().await.unwrap_or(None),
            None => None,
        };

        if manifest.is_empty() {
            info!("No prior index state, treating every eligible file as added");
            let (changes, skipped) = self.hash_scan(manifest).await?;
            return Ok(Detection {
                changes,
                source: DetectionSource::FirstRun,
                head,
                skipped,
            });
        }

        if let (Some(repo), Some(_)) = (&repo, &head) {
            match self.git_candidates(repo, reference, target).await {
                Ok(Some(candidates)) => {
                    debug!("git reported {} candidate changes", candidates.len());
                    let candidates = candidates.with_rechecks(manifest.diverged_paths());
                    let (changes, skipped) = self.confirm(manifest, candidates).await?;
                    return Ok(Detection {
                        changes,
                        source: DetectionSource::Git,
                        head,
                        skipped,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("git diff failed, falling back to hash comparison: {}", e),
            }
        }

        let (changes, skipped) = self.hash_scan(manifest).await?;
        Ok(Detection {
            changes,
            source: DetectionSource::HashFallback,
            head,
            skipped,
        })
    }

    /// Which paths on disk differ from HEAD right now.
    pub async fn head_divergence(&self) -> HeadDivergence {
        let Some(repo) = GitRepo::discover(&self.root).await else {
            return HeadDivergence::NoHistory;
        };
        match repo.head().await {
            Ok(Some(_)) => {}
            Ok(None) => return HeadDivergence::NoHistory,
            Err(e) => {
                warn!("Cannot resolve HEAD: {}", e);
                return HeadDivergence::Unknown;
            }
        }

        let (entries, untracked) =
            match tokio::try_join!(repo.diff_name_status(&["HEAD"]), repo.untracked_files()) {
                Ok(found) => found,
                Err(e) => {
                    warn!("Cannot compare working tree with HEAD: {}", e);
                    return HeadDivergence::Unknown;
                }
            };

        let mut paths: BTreeSet<String> = untracked.into_iter().collect();
        for entry in entries {
            match entry {
                DiffEntry::Added(p) | DiffEntry::Modified(p) | DiffEntry::Deleted(p) => {
                    paths.insert(p);
                }
                DiffEntry::Renamed { from, to } => {
                    paths.insert(from);
                    paths.insert(to);
                }
            }
        }
        HeadDivergence::Paths(paths)
    }

    /// Every eligible file is re-processed; records whose files vanished are
    /// deleted.
    pub async fn detect_full(&self, manifest: &IndexManifest) -> Result<Detection> {
        let repo = GitRepo::discover(&self.root).await;
        let head = match &repo {
            Some(repo) => repo.head().await.unwrap_or(None),
            None => None,
        };

        let files = self.filter.scan(&self.root)?;
        let states = self.inspect_all(files).await;

        let mut added = Vec::new();
        let mut modified = Vec::new();
        let mut skipped = Vec::new();
        let mut present = BTreeSet::new();
        for (path, state) in states {
            match state {
                DiskState::Present(_) => {
                    present.insert(path.clone());
                    if manifest.get(&path).is_some() {
                        modified.push(path);
                    } else {
                        added.push(path);
                    }
                }
                DiskState::Unreadable(e) => {
                    warn!("Skipping unreadable file {}: {}", path, e);
                    present.insert(path.clone());
                    skipped.push(path);
                }
                DiskState::Missing | DiskState::Excluded => {}
            }
        }
        let deleted = manifest
            .files
            .keys()
            .filter(|p| !present.contains(*p))
            .cloned()
            .collect();

        Ok(Detection {
            changes: ChangeSet::new(added, modified, deleted, Vec::new()),
            source: DetectionSource::Full,
            head,
            skipped,
        })
    }

    /// Check candidate changes against the manifest by content hash.
    ///
    /// Drops candidates whose bytes already match their record, turns
    /// vanished or excluded files into deletions, and pairs a deletion with an
    /// addition of identical, unique content into a rename. Returns the
    /// confirmed change set and the paths that could not be read.
    pub async fn confirm(
        &self,
        manifest: &IndexManifest,
        candidates: ChangeSet,
    ) -> Result<(ChangeSet, Vec<String>)> {
        let mut check: BTreeSet<String> = BTreeSet::new();
        let mut gone: BTreeSet<String> = BTreeSet::new();
        let mut renames: Vec<(String, String)> = Vec::new();

        check.extend(candidates.added.iter().cloned());
        check.extend(candidates.modified.iter().cloned());
        gone.extend(candidates.deleted.iter().cloned());

        // Renames need both ends inspected before they can be classified.
        let rename_ends: Vec<String> = candidates
            .renamed
            .iter()
            .flat_map(|(from, to)| [from.clone(), to.clone()])
            .collect();
        let rename_states: HashMap<String, DiskState> =
            self.inspect_all(rename_ends).await.into_iter().collect();

        let mut skipped = Vec::new();
        for (from, to) in &candidates.renamed {
            let from_still_there = matches!(rename_states.get(from), Some(DiskState::Present(_)));
            match (manifest.get(from), rename_states.get(to)) {
                (Some(_), Some(DiskState::Present(_))) if !from_still_there => {
                    renames.push((from.clone(), to.clone()));
                }
                (Some(_), Some(DiskState::Present(_))) => {
                    check.insert(from.clone());
                    check.insert(to.clone());
                }
                (Some(_), Some(DiskState::Unreadable(e))) => {
                    warn!("Skipping unreadable file {}: {}", to, e);
                    skipped.push(to.clone());
                }
                (Some(_), _) => {
                    gone.insert(from.clone());
                }
                (None, _) => {
                    check.insert(to.clone());
                }
            }
        }

        let inspect_paths: Vec<String> = check.union(&gone).cloned().collect();
        let states: BTreeMap<String, DiskState> =
            self.inspect_all(inspect_paths).await.into_iter().collect();

        let mut added: Vec<(String, ContentHash)> = Vec::new();
        let mut modified = Vec::new();
        let mut deleted = Vec::new();

        for (path, state) in states {
            let record = manifest.get(&path);
            match state {
                DiskState::Present(hash) => match record {
                    Some(r) if r.content_hash == hash => {}
                    Some(_) => modified.push(path),
                    None => added.push((path, hash)),
                },
                DiskState::Missing | DiskState::Excluded => {
                    if record.is_some() {
                        deleted.push(path);
                    }
                }
                DiskState::Unreadable(e) => {
                    warn!("Skipping unreadable file {}: {}", path, e);
                    skipped.push(path);
                }
            }
        }

        let (added, deleted) = pair_renames(manifest, added, deleted, &mut renames);

        skipped.sort();
        skipped.dedup();
        Ok((ChangeSet::new(added, modified, deleted, renames), skipped))
    }

    /// Hash comparison of the whole tree against the manifest.
    async fn hash_scan(&self, manifest: &IndexManifest) -> Result<(ChangeSet, Vec<String>)> {
        let files = self.filter.scan(&self.root)?;
        let deleted = manifest.find_deleted_files(&files);
        let candidates = ChangeSet::new(files, Vec::new(), deleted, Vec::new());
        self.confirm(manifest, candidates).await
    }

    /// Turn a git diff into candidate changes. `Ok(None)` means git cannot
    /// answer for this reference and the caller should fall back.
    async fn git_candidates(
        &self,
        repo: &GitRepo,
        reference: Option<&str>,
        target: &DiffTarget,
    ) -> Result<Option<ChangeSet>> {
        let (base, revs): (String, Vec<String>) = match target {
            DiffTarget::BranchBase(branch) => {
                let base = repo.merge_base(branch, "HEAD").await?;
                (base.clone(), vec![base, "HEAD".to_string()])
            }
            other => {
                let Some(reference) = reference else {
                    debug!("No reference commit recorded, using hash comparison");
                    return Ok(None);
                };
                if !repo.commit_exists(reference).await {
                    warn!(
                        "Reference commit {} no longer exists, using hash comparison",
                        reference
                    );
                    return Ok(None);
                }
                let revs = match other {
                    DiffTarget::Head => vec![reference.to_string(), "HEAD".to_string()],
                    DiffTarget::Staged => vec!["--cached".to_string(), reference.to_string()],
                    _ => vec![reference.to_string()],
                };
                (reference.to_string(), revs)
            }
        };

        debug!("Diffing {:?} against {:?}", base, target);
        let rev_refs: Vec<&str> = revs.iter().map(String::as_str).collect();
        let entries = repo.diff_name_status(&rev_refs).await?;

        let mut added = Vec::new();
        let mut modified = Vec::new();
        let mut deleted = Vec::new();
        let mut renamed = Vec::new();
        for entry in entries {
            match entry {
                DiffEntry::Added(p) => added.push(p),
                DiffEntry::Modified(p) => modified.push(p),
                DiffEntry::Deleted(p) => deleted.push(p),
                DiffEntry::Renamed { from, to } => renamed.push((from, to)),
            }
        }

        if *target == DiffTarget::WorkingTree {
            added.extend(repo.untracked_files().await?);
        }

        Ok(Some(ChangeSet::new(added, modified, deleted, renamed)))
    }

    async fn inspect_all(&self, paths: Vec<String>) -> Vec<(String, DiskState)> {
        stream::iter(paths)
            .map(|path| async move {
                let state = self.inspect(&path).await;
                (path, state)
            })
            .buffered(self.workers)
            .collect()
            .await
    }

    async fn inspect(&self, rel_path: &str) -> DiskState {
        if !self.filter.is_eligible(rel_path) {
            return DiskState::Excluded;
        }
        let abs = self.root.join(rel_path);
        let meta = match tokio::fs::metadata(&abs).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return DiskState::Missing,
            Err(e) => return DiskState::Unreadable(e),
        };
        if !meta.is_file() {
            return DiskState::Missing;
        }
        if !self.filter.within_size(meta.len()) {
            return DiskState::Excluded;
        }
        match tokio::fs::read(&abs).await {
            Ok(bytes) if is_binary(&bytes) => DiskState::Excluded,
            Ok(bytes) => DiskState::Present(ContentHash::of(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DiskState::Missing,
            Err(e) => DiskState::Unreadable(e),
        }
    }
}

/// Pair deletions with additions of identical content. Only hashes that are
/// unique on both sides are paired; anything ambiguous stays add + delete.
fn pair_renames(
    manifest: &IndexManifest,
    added: Vec<(String, ContentHash)>,
    deleted: Vec<String>,
    renames: &mut Vec<(String, String)>,
) -> (Vec<String>, Vec<String>) {
    let mut deleted_by_hash: HashMap<&ContentHash, Vec<&String>> = HashMap::new();
    for path in &deleted {
        if let Some(record) = manifest.get(path) {
            deleted_by_hash.entry(&record.content_hash).or_default().push(path);
        }
    }
    let mut added_by_hash: HashMap<&ContentHash, usize> = HashMap::new();
    for (_, hash) in &added {
        *added_by_hash.entry(hash).or_default() += 1;
    }

    let mut paired_deletes: BTreeSet<String> = BTreeSet::new();
    let mut remaining_added = Vec::new();
    for (path, hash) in &added {
        let unique_add = added_by_hash.get(hash).copied() == Some(1);
        match deleted_by_hash.get(hash) {
            Some(sources) if unique_add && sources.len() == 1 => {
                debug!("Pairing {} -> {} as rename", sources[0], path);
                paired_deletes.insert(sources[0].clone());
                renames.push((sources[0].clone(), path.clone()));
            }
            _ => remaining_added.push(path.clone()),
        }
    }

    let remaining_deleted = deleted
        .into_iter()
        .filter(|p| !paired_deletes.contains(p))
        .collect();
    (remaining_added, remaining_deleted)
}
