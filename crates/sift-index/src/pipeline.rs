//! Pipeline orchestrator.
//!
//! One run: take the lock, load the checkpoint and manifest, detect changes,
//! then per batch embed, write to the store, save the manifest and save the
//! checkpoint, in that order. Deletions and renames go first as their own
//! batch since they need no embedding.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchMetrics, BatchOptimizer, BatchOptimizerConfig, BatchOutcome};
use crate::change::{
    ChangeDetector, ChangeSet, Detection, DetectionSource, DiffTarget, HeadDivergence,
};
use crate::checkpoint::{Checkpoint, CheckpointStore, RunLock};
use crate::embeddings::{EmbedError, EmbeddingProvider};
use crate::entity::{mint_entities, ChunkVariant, Entity};
use crate::error::{IndexError, Result};
use crate::extract::Extractor;
use crate::freshness::{assess_freshness, Freshness};
use crate::git::GitRepo;
use crate::hasher::{hash_file, ContentHash};
use crate::manifest::{lineage_for, FileRecord, IndexManifest};
use crate::progress::{ProgressReporter, ProgressSnapshot};
use crate::result::IndexResult;
use crate::retry::RetryPolicy;
use crate::scanner::{FileFilter, ScanConfig};
use crate::store::{EmbeddedEntity, VectorStore};
use crate::writer::{partition_new, IndexWriter, WriteStats};

/// How a run decides what to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexMode {
    /// Re-process every eligible file and drop records of vanished files
    Full,
    /// Only what changed against the given target
    Auto(DiffTarget),
}

impl Default for IndexMode {
    fn default() -> Self {
        Self::Auto(DiffTarget::WorkingTree)
    }
}

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// State directory; relative paths are resolved against the indexed root
    pub state_dir: PathBuf,
    pub scan: ScanConfig,
    /// Concurrent file reads and extractions
    pub workers: usize,
    /// Upper bound on files per checkpointed batch
    pub files_per_batch: usize,
    /// Which representations to produce per entity
    pub variants: Vec<ChunkVariant>,
    pub batch: BatchOptimizerConfig,
    pub retry: RetryPolicy,
    /// In-flight embedding requests when no shared semaphore is supplied
    pub embed_concurrency: usize,
    /// Age after which an index counts as stale
    pub max_age: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        Self {
            state_dir: PathBuf::from(crate::DEFAULT_STATE_DIR),
            scan: ScanConfig::default(),
            workers,
            files_per_batch: 16,
            variants: vec![ChunkVariant::Metadata],
            batch: BatchOptimizerConfig::default(),
            retry: RetryPolicy::default(),
            embed_concurrency: 2,
            max_age: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// Exclusive state of one run: the lock, the checkpoint and the manifest.
pub struct RunContext {
    state_dir: PathBuf,
    _lock: RunLock,
    checkpoints: CheckpointStore,
    checkpoint: Checkpoint,
    manifest: IndexManifest,
    resumed: bool,
}

impl RunContext {
    /// Take the lock and load prior state. Fails with `LockConflict` when
    /// another run owns the target and with `CheckpointCorrupt` when the
    /// state cannot be read.
    pub async fn open(state_dir: &Path) -> Result<Self> {
        let lock = RunLock::acquire(state_dir)?;
        let checkpoints = CheckpointStore::new(state_dir);
        let previous = checkpoints.load().await?;
        let manifest = IndexManifest::load(state_dir).await?;

        let (checkpoint, resumed) = match previous {
            Some(cp) if cp.status.is_resumable() => {
                info!(
                    "Resuming run {} after batch {:?} ({} files done)",
                    cp.run_id,
                    cp.last_completed_batch_index,
                    cp.processed_files.len()
                );
                (cp, true)
            }
            Some(cp) => (Checkpoint::new_run(cp.last_indexed_commit, None), false),
            None => (Checkpoint::new_run(None, None), false),
        };

        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            _lock: lock,
            checkpoints,
            checkpoint,
            manifest,
            resumed,
        })
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Commit the change detector diffs from.
    pub fn reference(&self) -> Option<&str> {
        self.checkpoint.last_indexed_commit.as_deref()
    }

    async fn begin(&mut self, target_commit: Option<String>) -> Result<()> {
        self.checkpoint.target_commit = target_commit;
        self.checkpoint.begin();
        self.save_checkpoint().await
    }

    async fn save_checkpoint(&self) -> Result<()> {
        self.checkpoints.save(&self.checkpoint).await
    }
}

/// A file ready for embedding and writing.
struct PreparedFile {
    path: String,
    hash: ContentHash,
    modification_time: u64,
    lineage: String,
    has_record: bool,
    previous_ids: BTreeSet<String>,
    current_ids: BTreeSet<String>,
    fresh: Vec<Entity>,
}

enum Prepared {
    Ready(PreparedFile),
    Unreadable { path: String, error: IndexError },
    Failed { path: String, error: IndexError },
}

/// What the prior record says about a file about to be indexed.
struct WorkItem {
    path: String,
    lineage: Option<String>,
    previous_ids: BTreeSet<String>,
}

enum Flow {
    Finished,
    Cancelled,
}

/// Per-run counters threaded through the batches.
struct RunState {
    result: IndexResult,
    progress: ProgressReporter,
    optimizer: BatchOptimizer,
    batch_index: u64,
    head: Option<String>,
    unreadable: usize,
    divergence: HeadDivergence,
    /// HEAD differs from the reference the run diffed from
    head_moved: bool,
}

impl RunState {
    /// Whether a record written now would differ from the commit the index
    /// refers to afterwards.
    fn diverged(&self, path: &str) -> bool {
        self.head_moved || self.divergence.contains(path)
    }
}

/// Incremental indexing pipeline over an extractor, an embedding provider
/// and a vector store.
pub struct Pipeline<X, E, S> {
    config: PipelineConfig,
    extractor: Arc<X>,
    embedder: Arc<E>,
    store: Arc<S>,
    embed_permits: Arc<Semaphore>,
    cancel: CancellationToken,
    progress_tx: Arc<watch::Sender<ProgressSnapshot>>,
}

impl<X, E, S> Pipeline<X, E, S>
where
    X: Extractor + 'static,
    E: EmbeddingProvider + 'static,
    S: VectorStore + 'static,
{
    pub fn new(config: PipelineConfig, extractor: Arc<X>, embedder: Arc<E>, store: Arc<S>) -> Self {
        let permits = config.embed_concurrency.max(1);
        let (progress_tx, _) = watch::channel(ProgressSnapshot::default());
        Self {
            config,
            extractor,
            embedder,
            store,
            embed_permits: Arc::new(Semaphore::new(permits)),
            cancel: CancellationToken::new(),
            progress_tx: Arc::new(progress_tx),
        }
    }

    /// Share one bound on in-flight embedding requests across pipelines.
    pub fn with_embed_semaphore(mut self, permits: Arc<Semaphore>) -> Self {
        self.embed_permits = permits;
        self
    }

    /// Cancellation is honored between batches.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_tx.subscribe()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Where manifest, checkpoint and lock live for `root`.
    pub fn state_dir(&self, root: &Path) -> PathBuf {
        if self.config.state_dir.is_absolute() {
            self.config.state_dir.clone()
        } else {
            root.join(&self.config.state_dir)
        }
    }

    /// Detect, extract, embed, write and checkpoint everything that changed
    /// under `root`. Resumes an interrupted run.
    pub async fn index_repository(&self, root: &Path, mode: IndexMode) -> Result<IndexResult> {
        let started = Instant::now();
        let mut ctx = RunContext::open(&self.state_dir(root)).await?;
        let detector = self.detector(root)?;

        let detection = match &mode {
            IndexMode::Full => detector.detect_full(&ctx.manifest).await?,
            IndexMode::Auto(target) => {
                detector
                    .detect(&ctx.manifest, ctx.reference(), target)
                    .await?
            }
        };
        info!(
            "Detected {} changes via {:?} ({} added, {} modified, {} deleted, {} renamed)",
            detection.changes.len(),
            detection.source,
            detection.changes.added().len(),
            detection.changes.modified().len(),
            detection.changes.deleted().len(),
            detection.changes.renamed().len()
        );

        let force = mode == IndexMode::Full;
        self.execute(root, &mut ctx, detection, force, started).await
    }

    /// Same sequencing as [`index_repository`](Self::index_repository) for a
    /// caller-supplied change set. Candidates are confirmed against the
    /// manifest first, so already indexed content is not re-processed.
    pub async fn index_changeset(&self, root: &Path, changes: ChangeSet) -> Result<IndexResult> {
        let started = Instant::now();
        let mut ctx = RunContext::open(&self.state_dir(root)).await?;
        let detector = self.detector(root)?;

        let (changes, skipped) = detector.confirm(&ctx.manifest, changes).await?;
        let head = match GitRepo::discover(root).await {
            Some(repo) => repo.head().await.unwrap_or(None),
            None => None,
        };
        let detection = Detection {
            changes,
            source: DetectionSource::Supplied,
            head,
            skipped,
        };
        self.execute(root, &mut ctx, detection, false, started).await
    }

    /// Change detection alone; takes no lock and writes nothing.
    pub async fn detect_changes(&self, root: &Path, target: &DiffTarget) -> Result<Detection> {
        let state_dir = self.state_dir(root);
        let manifest = IndexManifest::load(&state_dir).await?;
        let checkpoint = CheckpointStore::new(&state_dir).load().await?;
        let reference = checkpoint.as_ref().and_then(|c| c.last_indexed_commit.as_deref());
        self.detector(root)?.detect(&manifest, reference, target).await
    }

    /// Whether the index of `root` is stale.
    pub async fn freshness(&self, root: &Path) -> Result<Freshness> {
        let checkpoint = CheckpointStore::new(&self.state_dir(root)).load().await?;
        let head = match GitRepo::discover(root).await {
            Some(repo) => repo.head().await.unwrap_or(None),
            None => None,
        };
        Ok(assess_freshness(
            checkpoint.as_ref(),
            head.as_deref(),
            Utc::now(),
            self.config.max_age,
        ))
    }

    fn detector(&self, root: &Path) -> Result<ChangeDetector> {
        let mut scan = self.config.scan.clone();
        if let Some(name) = self.state_dir(root).file_name() {
            scan.state_dir = name.to_string_lossy().into_owned();
        }
        let filter = FileFilter::new(root, scan)?;
        Ok(ChangeDetector::new(root, filter, self.config.workers))
    }

    async fn execute(
        &self,
        root: &Path,
        ctx: &mut RunContext,
        detection: Detection,
        force: bool,
        started: Instant,
    ) -> Result<IndexResult> {
        ctx.begin(detection.head.clone()).await?;

        let mut result = IndexResult::new(ctx.checkpoint.run_id.clone());
        result.resumed = ctx.resumed;
        result.files_skipped += detection.skipped.len();

        if ctx.resumed {
            let pending = changed_paths(&detection.changes);
            let already_done = ctx
                .checkpoint
                .processed_files
                .iter()
                .filter(|p| !pending.contains(*p))
                .count();
            debug!("{} files already processed before resume", already_done);
            result.files_skipped += already_done;
        }

        let divergence = self.detector(root)?.head_divergence().await;
        let head_moved = detection.head.is_some() && detection.head.as_deref() != ctx.reference();

        let mut state = RunState {
            result,
            progress: ProgressReporter::new(self.progress_tx.clone()),
            optimizer: BatchOptimizer::new(self.config.batch.clone(), self.embedder.max_batch_size()),
            batch_index: ctx.checkpoint.next_batch_index(),
            head: detection.head.clone(),
            unreadable: detection.skipped.len(),
            divergence,
            head_moved,
        };
        state.progress.start(detection.changes.len());

        let flow = self
            .run_batches(root, ctx, &detection.changes, force, &mut state)
            .await;

        let mut result = match flow {
            Ok(Flow::Finished) => {
                let advance = state.result.files_failed == 0 && state.unreadable == 0;
                if !advance {
                    warn!("Some files were not indexed; keeping the previous commit reference");
                }
                if let (true, HeadDivergence::Paths(paths)) = (advance, &state.divergence) {
                    if ctx.manifest.settle_divergence(paths) {
                        ctx.manifest.save(&ctx.state_dir).await?;
                    }
                }
                ctx.checkpoint.complete(advance);
                ctx.save_checkpoint().await?;
                let mut result = state.result;
                result.finish();
                result
            }
            Ok(Flow::Cancelled) => {
                info!("Run cancelled; progress kept at batch {:?}", ctx.checkpoint.last_completed_batch_index);
                let mut result = state.result;
                result.abort("cancelled");
                result
            }
            Err(IndexError::StoreWrite(e)) => {
                error!("Store write failed, aborting run: {}", e);
                ctx.checkpoint.fail();
                ctx.save_checkpoint().await?;
                let mut result = state.result;
                result.abort(format!("store write failed: {}", e));
                result
            }
            Err(e) => {
                ctx.checkpoint.fail();
                if let Err(save_err) = ctx.save_checkpoint().await {
                    warn!("Failed to record run failure: {}", save_err);
                }
                return Err(e);
            }
        };

        result.last_indexed_commit = ctx.checkpoint.last_indexed_commit.clone();
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!("Indexing finished: {}", result.summary());
        Ok(result)
    }

    async fn run_batches(
        &self,
        root: &Path,
        ctx: &mut RunContext,
        changes: &ChangeSet,
        force: bool,
        state: &mut RunState,
    ) -> Result<Flow> {
        if self.cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        let writer = IndexWriter::new(self.store.clone());
        let mut index_paths: Vec<String> = changes
            .added()
            .iter()
            .chain(changes.modified())
            .cloned()
            .collect();

        if !changes.deleted().is_empty() || !changes.renamed().is_empty() {
            let reindex = self.apply_structural(root, ctx, &writer, changes, state).await?;
            index_paths.extend(reindex);
        }

        index_paths.sort();
        index_paths.dedup();

        let items: Vec<WorkItem> = index_paths
            .into_iter()
            .map(|path| {
                let record = ctx.manifest.get(&path);
                WorkItem {
                    lineage: record.map(|r| r.lineage.clone()),
                    previous_ids: record
                        .map(|r| r.entity_ids.iter().cloned().collect())
                        .unwrap_or_default(),
                    path,
                }
            })
            .collect();

        let mut prepared = stream::iter(items)
            .map(move |item| self.prepare(root, item, force))
            .buffered(self.config.workers.max(1));

        let mut pending: Vec<PreparedFile> = Vec::new();
        let mut pending_entities = 0usize;

        while let Some(next) = prepared.next().await {
            match next {
                Prepared::Ready(file) => {
                    state.progress.entities_found(file.fresh.len());
                    pending_entities += file.fresh.len();
                    pending.push(file);
                }
                Prepared::Unreadable { path, error } => {
                    warn!("Skipping {}: {}", path, error);
                    state.result.files_skipped += 1;
                    state.unreadable += 1;
                    state.progress.files_settled(1);
                }
                Prepared::Failed { path, error } => {
                    warn!("Failed to prepare {}: {}", path, error);
                    state.result.record_failure(&path, &error);
                    state.progress.files_settled(1);
                }
            }

            let full = pending_entities >= state.optimizer.current_size()
                || pending.len() >= self.config.files_per_batch.max(1);
            if full && !pending.is_empty() {
                if self.cancel.is_cancelled() {
                    return Ok(Flow::Cancelled);
                }
                self.write_batch(ctx, &writer, std::mem::take(&mut pending), state)
                    .await?;
                pending_entities = 0;
            }
        }

        if !pending.is_empty() {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            self.write_batch(ctx, &writer, pending, state).await?;
        }

        Ok(Flow::Finished)
    }

    /// Deletions and renames, committed as one batch. Returns rename targets
    /// whose content changed; those are indexed as new files.
    async fn apply_structural(
        &self,
        root: &Path,
        ctx: &mut RunContext,
        writer: &IndexWriter<S>,
        changes: &ChangeSet,
        state: &mut RunState,
    ) -> Result<Vec<String>> {
        let mut stats = WriteStats::default();
        let mut touched = Vec::new();
        let mut reindex = Vec::new();
        let mut settled = 0;

        for path in changes.deleted() {
            stats.merge(writer.delete_file(path).await?);
            ctx.manifest.remove_file(path);
            touched.push(path.clone());
            settled += 1;
        }

        for (from, to) in changes.renamed() {
            let Some(old_hash) = ctx.manifest.get(from).map(|r| r.content_hash.clone()) else {
                reindex.push(to.clone());
                continue;
            };
            let new_hash = match hash_file(&root.join(to)).await {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Skipping rename {} -> {}: {}", from, to, e);
                    state.result.files_skipped += 1;
                    state.unreadable += 1;
                    continue;
                }
            };

            if new_hash == old_hash {
                let target_had_record = ctx.manifest.get(to).is_some();
                stats.merge(writer.rename_file(from, to, target_had_record).await?);
                if target_had_record {
                    ctx.manifest.remove_file(to);
                }
                ctx.manifest.rename_file(from, to, state.head.clone());
                ctx.manifest.set_diverged(to, state.diverged(to));
                touched.push(from.clone());
                touched.push(to.clone());
                settled += 1;
            } else {
                // Content changed on the way: the old path goes, the new
                // path is indexed from scratch.
                stats.merge(writer.delete_file(from).await?);
                ctx.manifest.remove_file(from);
                touched.push(from.clone());
                reindex.push(to.clone());
            }
        }

        self.commit_batch(ctx, touched, state).await?;
        merge_stats(&mut state.result, stats);
        state.result.files_processed += settled;
        state.progress.files_settled(settled);
        Ok(reindex)
    }

    /// Read, hash and extract one file.
    async fn prepare(&self, root: &Path, item: WorkItem, force: bool) -> Prepared {
        let WorkItem {
            path,
            lineage,
            previous_ids,
        } = item;
        let abs = root.join(&path);

        let bytes = match tokio::fs::read(&abs).await {
            Ok(bytes) => bytes,
            Err(source) => {
                return Prepared::Unreadable {
                    path,
                    error: IndexError::FileRead { path: abs, source },
                }
            }
        };
        let modification_time = match tokio::fs::metadata(&abs).await {
            Ok(meta) => meta.modified().map(unix_ms).unwrap_or(0),
            Err(_) => 0,
        };
        let hash = ContentHash::of(&bytes);

        let extracted = if self.extractor.supports(&path) {
            let extractor = Arc::clone(&self.extractor);
            let content = String::from_utf8_lossy(&bytes).into_owned();
            let task_path = path.clone();
            match tokio::task::spawn_blocking(move || extractor.extract(&task_path, &content)).await {
                Ok(Ok(entities)) => entities,
                Ok(Err(e)) => {
                    return Prepared::Failed {
                        error: IndexError::Extract {
                            path: path.clone(),
                            reason: e.to_string(),
                        },
                        path,
                    }
                }
                Err(join) => {
                    return Prepared::Failed {
                        error: IndexError::Extract {
                            path: path.clone(),
                            reason: join.to_string(),
                        },
                        path,
                    }
                }
            }
        } else {
            debug!("No extractor support for {}, recording without entities", path);
            Vec::new()
        };

        let has_record = lineage.is_some();
        let lineage = lineage.unwrap_or_else(|| lineage_for(&path));
        let entities = mint_entities(&path, &lineage, &extracted, &self.config.variants);
        let current_ids: BTreeSet<String> = entities.iter().map(|e| e.id.clone()).collect();
        let (fresh, _) = partition_new(&previous_ids, entities, force);

        Prepared::Ready(PreparedFile {
            path,
            hash,
            modification_time,
            lineage,
            has_record,
            previous_ids,
            current_ids,
            fresh,
        })
    }

    /// Embed, write and commit one batch of prepared files.
    async fn write_batch(
        &self,
        ctx: &mut RunContext,
        writer: &IndexWriter<S>,
        files: Vec<PreparedFile>,
        state: &mut RunState,
    ) -> Result<()> {
        let texts: Vec<String> = files
            .iter()
            .flat_map(|f| f.fresh.iter().map(|e| e.text.clone()))
            .collect();

        let (mut vectors, batch_error) = if texts.is_empty() {
            (Vec::new().into_iter(), None)
        } else {
            match self.embed_all(&texts, state).await {
                Ok(vectors) => (vectors.into_iter(), None),
                Err(e) => {
                    warn!("Batch {} failed: {}", state.batch_index, e);
                    (Vec::new().into_iter(), Some(e))
                }
            }
        };

        let mut done = Vec::new();
        let mut stats = WriteStats::default();
        let mut entities_written = 0;
        let file_count = files.len();

        for file in files {
            if let Some(err) = &batch_error {
                if !file.fresh.is_empty() {
                    state.result.record_failure(&file.path, err);
                    continue;
                }
            }

            let embedded: Vec<EmbeddedEntity> = file
                .fresh
                .into_iter()
                .zip(vectors.by_ref())
                .map(|(entity, vector)| EmbeddedEntity { entity, vector })
                .collect();
            entities_written += file.current_ids.len();

            stats.merge(
                writer
                    .update_file(
                        &file.path,
                        &file.previous_ids,
                        &file.current_ids,
                        embedded,
                        file.has_record,
                    )
                    .await?,
            );

            ctx.manifest.record_indexed(FileRecord {
                path: file.path.clone(),
                content_hash: file.hash,
                last_seen_commit: state.head.clone(),
                modification_time: file.modification_time,
                lineage: file.lineage,
                entity_ids: file.current_ids.into_iter().collect(),
                diverged: state.diverged(&file.path),
            });
            done.push(file.path);
        }

        state.result.files_processed += done.len();
        self.commit_batch(ctx, done, state).await?;
        merge_stats(&mut state.result, stats);
        state.progress.batch_done(file_count, entities_written);
        Ok(())
    }

    /// Persist the manifest, then the checkpoint, after a batch's store
    /// writes have succeeded.
    async fn commit_batch(
        &self,
        ctx: &mut RunContext,
        files: Vec<String>,
        state: &mut RunState,
    ) -> Result<()> {
        ctx.manifest.save(&ctx.state_dir).await?;
        ctx.checkpoint.record_batch(state.batch_index, files);
        ctx.save_checkpoint().await?;
        state.batch_index += 1;
        state.result.batches += 1;
        Ok(())
    }

    /// Embed `texts` in optimizer-sized requests. Rejections shrink the
    /// request before retrying; transient failures and timeouts back off.
    async fn embed_all(&self, texts: &[String], state: &mut RunState) -> Result<Vec<Vec<f32>>> {
        let policy = &self.config.retry;
        let dimensions = self.embedder.dimensions();
        let mut out = Vec::with_capacity(texts.len());
        let mut offset = 0;

        while offset < texts.len() {
            let mut attempts = 0u32;
            loop {
                let size = state.optimizer.current_size().min(texts.len() - offset);
                let chunk = &texts[offset..offset + size];
                attempts += 1;

                let permit = self
                    .embed_permits
                    .acquire()
                    .await
                    .map_err(|_| IndexError::TransientProvider("embedding permits closed".into()))?;
                let call_started = Instant::now();
                let response =
                    tokio::time::timeout(policy.call_timeout, self.embedder.embed_batch(chunk)).await;
                drop(permit);
                state.result.embedding_calls += 1;

                let timed_out = response.is_err();
                let outcome = match response {
                    Ok(Ok(vectors)) if vectors.len() == size => Ok(vectors),
                    Ok(Ok(vectors)) => Err(EmbedError::Transient(format!(
                        "provider returned {} vectors for {} texts",
                        vectors.len(),
                        size
                    ))),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(EmbedError::Transient(format!(
                        "timed out after {:?}",
                        policy.call_timeout
                    ))),
                };

                let metrics_outcome = match &outcome {
                    Ok(_) => BatchOutcome::Success,
                    Err(EmbedError::RateLimited { .. }) => BatchOutcome::RateLimited,
                    Err(EmbedError::PayloadTooLarge) => BatchOutcome::PayloadTooLarge,
                    Err(EmbedError::Transient(_)) if timed_out => BatchOutcome::Timeout,
                    Err(EmbedError::Transient(_)) => BatchOutcome::Transient,
                };
                state.optimizer.record(BatchMetrics {
                    batch_size: size,
                    observed_latency: call_started.elapsed(),
                    memory_delta: BatchMetrics::estimate_memory(chunk, dimensions),
                    outcome: metrics_outcome,
                });

                let err = match outcome {
                    Ok(vectors) => {
                        out.extend(vectors);
                        offset += size;
                        break;
                    }
                    Err(err) => err,
                };

                let cannot_shrink = matches!(err, EmbedError::PayloadTooLarge)
                    && !state.optimizer.can_shrink_below(size);
                if cannot_shrink || !policy.allows_retry(attempts) {
                    return Err(match err {
                        EmbedError::RateLimited { .. } | EmbedError::PayloadTooLarge => {
                            IndexError::ProviderRejectedBatch {
                                batch_size: size,
                                reason: err.to_string(),
                            }
                        }
                        EmbedError::Transient(reason) => IndexError::TransientProvider(reason),
                    });
                }

                let delay = match &err {
                    EmbedError::RateLimited {
                        retry_after: Some(after),
                    } => *after,
                    EmbedError::PayloadTooLarge => Duration::ZERO,
                    _ => policy.backoff_for(attempts),
                };
                debug!(
                    "Embedding attempt {} of {} texts failed ({}), retrying in {:?}",
                    attempts, size, err, delay
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Ok(out)
    }
}

fn merge_stats(result: &mut IndexResult, stats: WriteStats) {
    result.entities_added += stats.entities_added;
    result.entities_removed += stats.entities_removed;
    result.entities_renamed += stats.entities_renamed;
    result.entities_unchanged += stats.entities_unchanged;
}

fn changed_paths(changes: &ChangeSet) -> BTreeSet<String> {
    let mut paths: BTreeSet<String> = BTreeSet::new();
    paths.extend(changes.added().iter().cloned());
    paths.extend(changes.modified().iter().cloned());
    paths.extend(changes.deleted().iter().cloned());
    for (from, to) in changes.renamed() {
        paths.insert(from.clone());
        paths.insert(to.clone());
    }
    paths
}

fn unix_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::RunStatus;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.state_dir, PathBuf::from(".sift"));
        assert_eq!(config.files_per_batch, 16);
        assert_eq!(config.variants, vec![ChunkVariant::Metadata]);
        assert!(config.workers >= 1 && config.workers <= 8);
        assert_eq!(IndexMode::default(), IndexMode::Auto(DiffTarget::WorkingTree));
    }

    #[tokio::test]
    async fn test_run_context_fresh_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::open(dir.path()).await.unwrap();
        assert!(!ctx.is_resumed());
        assert_eq!(ctx.checkpoint().status, RunStatus::NotStarted);
        assert!(ctx.manifest().is_empty());

        let err = RunContext::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, IndexError::LockConflict { .. }));
    }

    #[tokio::test]
    async fn test_run_context_resumes_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut cp = Checkpoint::new_run(Some("base".into()), Some("head".into()));
        cp.begin();
        cp.record_batch(0, vec!["a.py".to_string()]);
        cp.fail();
        store.save(&cp).await.unwrap();

        let ctx = RunContext::open(dir.path()).await.unwrap();
        assert!(ctx.is_resumed());
        assert_eq!(ctx.checkpoint().run_id, cp.run_id);
        assert_eq!(ctx.checkpoint().next_batch_index(), 1);
        assert_eq!(ctx.reference(), Some("base"));
    }

    #[tokio::test]
    async fn test_run_context_after_completed_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut cp = Checkpoint::new_run(None, Some("c1".into()));
        cp.begin();
        cp.complete(true);
        store.save(&cp).await.unwrap();

        let ctx = RunContext::open(dir.path()).await.unwrap();
        assert!(!ctx.is_resumed());
        assert_ne!(ctx.checkpoint().run_id, cp.run_id);
        assert_eq!(ctx.reference(), Some("c1"));
    }

    #[test]
    fn test_changed_paths() {
        let cs = ChangeSet::new(
            vec!["a".into()],
            vec!["m".into()],
            vec!["d".into()],
            vec![("r1".into(), "r2".into())],
        );
        let paths = changed_paths(&cs);
        assert_eq!(paths.len(), 5);
        assert!(paths.contains("r2"));
    }
}
