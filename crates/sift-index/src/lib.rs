//! Incremental semantic indexing for sift.
//!
//! This crate provides:
//! - Change detection from git history with a content-hash fallback
//! - Entity extraction at the parser boundary (tree-sitter adapter included)
//! - Adaptive batching of embedding requests with shrink-on-rejection
//! - Resumable runs backed by an atomic, lock-guarded checkpoint
//! - Idempotent writes to a vector store (Qdrant or in-memory)
//!
//! ## Pipeline
//!
//! ```text
//! Working tree + git history + manifest
//!     │
//!     ├──> ChangeDetector ──> ChangeSet
//!     │
//!     ├──> worker pool: read, hash, extract ──> Entities
//!     │
//!     ├──> BatchOptimizer + EmbeddingProvider ──> vectors
//!     │
//!     ├──> IndexWriter ──> VectorStore
//!     │
//!     └──> manifest save, then checkpoint (per batch)
//! ```

pub mod batch;
pub mod change;
pub mod checkpoint;
pub mod embeddings;
pub mod entity;
pub mod error;
pub mod extract;
pub mod freshness;
pub mod git;
pub mod hasher;
pub mod manifest;
pub mod pipeline;
pub mod progress;
pub mod qdrant;
pub mod result;
pub mod retry;
pub mod scanner;
pub mod store;
pub mod writer;

// Re-exports
pub use batch::{BatchMetrics, BatchOptimizer, BatchOptimizerConfig, BatchOutcome};
pub use change::{
    ChangeDetector, ChangeSet, Detection, DetectionSource, DiffTarget, HeadDivergence,
};
pub use checkpoint::{read_checkpoint, Checkpoint, CheckpointStore, RunLock, RunStatus};
pub use embeddings::{EmbedError, EmbeddingProvider, HttpEmbeddings};
pub use entity::{ChunkVariant, Entity, EntityKind, ExtractedEntity, Span};
pub use error::{IndexError, Result};
pub use extract::{ExtractError, Extractor, TreeSitterExtractor};
pub use freshness::{assess_freshness, Freshness, StaleReason};
pub use hasher::ContentHash;
pub use manifest::{FileRecord, IndexManifest};
pub use pipeline::{IndexMode, Pipeline, PipelineConfig, RunContext};
pub use progress::{ProgressReporter, ProgressSnapshot};
pub use qdrant::{QdrantConfig, QdrantStore};
pub use result::{FileFailure, IndexResult, RunOutcome};
pub use retry::RetryPolicy;
pub use scanner::{FileFilter, ScanConfig};
pub use store::{EmbeddedEntity, MemoryStore, Origin, StoreError, StoredEntity, VectorStore};
pub use writer::{IndexWriter, WriteStats};

/// Default Qdrant collection name
pub const DEFAULT_COLLECTION: &str = "sift-codebase";

/// Default embedding dimensions (Qwen3-Embedding-8B)
pub const DEFAULT_DIMENSIONS: usize = 4096;

/// Directory (relative to the indexed root) holding manifest, checkpoint and lock.
pub const DEFAULT_STATE_DIR: &str = ".sift";
