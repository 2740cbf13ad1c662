//! sift: keep a vector index of a source tree in sync with its changes.
//!
//! ```bash
//! sift                  # index what changed in the working tree
//! sift --head           # committed changes since the last run
//! sift --base main      # changes since this branch left main
//! sift --full           # re-embed everything
//! sift --status         # is the index stale?
//! sift --detect --json  # show what would be indexed
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use sift_config::{resolve_secret, Config};
use sift_index::git::GitRepo;
use sift_index::{
    assess_freshness, read_checkpoint, BatchOptimizerConfig, ChangeDetector, CheckpointStore,
    ChunkVariant, DiffTarget, FileFilter, HttpEmbeddings, IndexManifest, IndexMode, Pipeline,
    PipelineConfig, QdrantConfig, QdrantStore, RetryPolicy, RunOutcome, ScanConfig,
    TreeSitterExtractor,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sift", version, about)]
struct Cli {
    /// Repository root to index
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Re-process every eligible file
    #[arg(long, conflicts_with_all = ["head", "staged", "base"])]
    full: bool,

    /// Only committed changes (last indexed commit..HEAD)
    #[arg(long, conflicts_with_all = ["staged", "base"])]
    head: bool,

    /// Only staged changes
    #[arg(long, conflicts_with = "base")]
    staged: bool,

    /// Changes since the current branch diverged from BRANCH
    #[arg(long, value_name = "BRANCH")]
    base: Option<String>,

    /// Report whether the index is stale and exit
    #[arg(long)]
    status: bool,

    /// Detect changes without indexing
    #[arg(long)]
    detect: bool,

    /// Delete the checkpoint (recovery from a corrupt checkpoint)
    #[arg(long)]
    reset: bool,

    /// Config file to use instead of the layered lookup
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the default config to .sift.toml in the repository and exit
    #[arg(long)]
    init_config: bool,

    /// Machine-readable output
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn diff_target(&self) -> DiffTarget {
        if let Some(branch) = &self.base {
            DiffTarget::BranchBase(branch.clone())
        } else if self.staged {
            DiffTarget::Staged
        } else if self.head {
            DiffTarget::Head
        } else {
            DiffTarget::WorkingTree
        }
    }

    fn mode(&self) -> IndexMode {
        if self.full {
            IndexMode::Full
        } else {
            IndexMode::Auto(self.diff_target())
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("sift=debug,sift_index=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sift=info,sift_index=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))?;
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let root = cli
        .path
        .canonicalize()
        .with_context(|| format!("Repository path {} not found", cli.path.display()))?;

    if cli.init_config {
        let path = root.join(sift_config::PROJECT_CONFIG_FILE);
        Config::write_default(&path)?;
        println!("Wrote {}", path.display());
        return Ok(0);
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load(&root)?,
    };
    let state_dir = state_dir_for(&root, &config);

    if cli.reset {
        CheckpointStore::new(&state_dir).reset().await?;
        println!("Checkpoint removed");
        return Ok(0);
    }
    if cli.status {
        return status(&root, &state_dir, &config, cli.json).await;
    }
    if cli.detect {
        return detect(&root, &state_dir, &config, &cli.diff_target(), cli.json).await;
    }

    let pipeline_config = pipeline_config(&config, &state_dir)?;

    let api_key = resolve_secret(config.embeddings.api_key.as_deref())?
        .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
        .context(
            "No API key configured. Set embeddings.api_key in config or OPENROUTER_API_KEY environment variable",
        )?;
    let mut embedder = HttpEmbeddings::new(
        api_key,
        Some(config.embeddings.model.clone()),
        Some(config.embeddings.dimensions),
    )
    .with_max_batch_size(config.embeddings.max_batch_size);
    if let Some(url) = &config.embeddings.base_url {
        embedder = embedder.with_base_url(url.clone());
    }

    let store = QdrantStore::from_config(&QdrantConfig {
        url: config.store.qdrant_url.clone(),
        api_key: resolve_secret(config.store.qdrant_api_key.as_deref())?,
        collection_name: config.store.collection_name.clone(),
        dimensions: config.embeddings.dimensions,
    })
    .await?;
    store.check_collection().await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current batch");
            on_signal.cancel();
        }
    });

    let pipeline = Pipeline::new(
        pipeline_config,
        Arc::new(TreeSitterExtractor),
        Arc::new(embedder),
        Arc::new(store),
    )
    .with_cancellation(cancel);

    info!("Indexing {}", root.display());
    let result = pipeline.index_repository(&root, cli.mode()).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.summary());
        for failure in &result.errors {
            println!("  failed: {} ({})", failure.path, failure.error);
        }
        if let Some(reason) = &result.abort_reason {
            println!("  aborted: {}", reason);
        }
    }

    Ok(match result.status {
        RunOutcome::Completed => 0,
        RunOutcome::CompletedWithErrors => 1,
        RunOutcome::Aborted => 2,
    })
}

async fn status(root: &Path, state_dir: &Path, config: &Config, json: bool) -> Result<i32> {
    let checkpoint = read_checkpoint(state_dir).await?;
    let head = match GitRepo::discover(root).await {
        Some(repo) => repo.head().await?,
        None => None,
    };
    let freshness = assess_freshness(
        checkpoint.as_ref(),
        head.as_deref(),
        Utc::now(),
        config.max_age_secs().map(Duration::from_secs),
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&freshness)?);
    } else if freshness.stale {
        println!("stale: {:?}", freshness.reasons);
    } else {
        println!("fresh");
    }
    Ok(if freshness.stale { 1 } else { 0 })
}

async fn detect(
    root: &Path,
    state_dir: &Path,
    config: &Config,
    target: &DiffTarget,
    json: bool,
) -> Result<i32> {
    let manifest = IndexManifest::load(state_dir).await?;
    let checkpoint = read_checkpoint(state_dir).await?;
    let reference = checkpoint.as_ref().and_then(|c| c.last_indexed_commit.as_deref());

    let filter = FileFilter::new(root, scan_config(config, state_dir))?;
    let detector = ChangeDetector::new(root, filter, config.index.workers);
    let detection = detector.detect(&manifest, reference, target).await?;
    let changes = &detection.changes;

    if json {
        let value = serde_json::json!({
            "source": detection.source,
            "head": detection.head,
            "added": changes.added(),
            "modified": changes.modified(),
            "deleted": changes.deleted(),
            "renamed": changes.renamed(),
            "skipped": detection.skipped,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{} changes ({:?})", changes.len(), detection.source);
        for path in changes.added() {
            println!("  A {}", path);
        }
        for path in changes.modified() {
            println!("  M {}", path);
        }
        for path in changes.deleted() {
            println!("  D {}", path);
        }
        for (from, to) in changes.renamed() {
            println!("  R {} -> {}", from, to);
        }
    }
    Ok(0)
}

fn state_dir_for(root: &Path, config: &Config) -> PathBuf {
    let dir = sift_config::expand_path(&config.index.state_dir);
    if dir.is_absolute() {
        dir
    } else {
        root.join(dir)
    }
}

fn scan_config(config: &Config, state_dir: &Path) -> ScanConfig {
    ScanConfig {
        extensions: config.index.extensions.clone(),
        exclude: config.index.exclude.clone(),
        respect_gitignore: config.index.respect_gitignore,
        max_file_bytes: config.index.max_file_bytes,
        state_dir: state_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| sift_index::DEFAULT_STATE_DIR.to_string()),
    }
}

fn pipeline_config(config: &Config, state_dir: &Path) -> Result<PipelineConfig> {
    let variants = config
        .index
        .variants
        .iter()
        .map(|v| match v.as_str() {
            "metadata" => Ok(ChunkVariant::Metadata),
            "full" => Ok(ChunkVariant::Full),
            other => anyhow::bail!("Unknown chunk variant '{}'", other),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PipelineConfig {
        state_dir: state_dir.to_path_buf(),
        scan: scan_config(config, state_dir),
        workers: config.index.workers,
        files_per_batch: config.index.files_per_batch,
        variants,
        batch: BatchOptimizerConfig {
            initial_size: config.batching.initial_size,
            min_size: config.batching.min_size,
            growth_factor: config.batching.growth_factor,
            shrink_factor: config.batching.shrink_factor,
            latency_ceiling: Duration::from_millis(config.batching.latency_ceiling_ms),
            memory_ceiling: config.batching.memory_ceiling_bytes,
        },
        retry: RetryPolicy {
            max_attempts: config.retry.max_attempts,
            base_backoff: Duration::from_millis(config.retry.base_backoff_ms),
            max_backoff: Duration::from_millis(config.retry.max_backoff_ms),
            call_timeout: Duration::from_secs(config.retry.call_timeout_secs),
        },
        embed_concurrency: config.embeddings.max_concurrency,
        max_age: config.max_age_secs().map(Duration::from_secs),
    })
}
