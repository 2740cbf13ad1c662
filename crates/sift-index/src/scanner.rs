//! Working-tree enumeration and file eligibility.
//!
//! Every path the pipeline considers, whether it came from a directory walk or
//! from a git diff, passes through [`FileFilter`] so that excluded and binary
//! files are dropped before they are hashed.

use std::path::{Component, Path};

use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IndexError, Result};

/// Directories that never contain indexable sources.
const EXCLUDED_DIRS: &[&str] = &["target", "node_modules", ".git", "vendor", "__pycache__"];

/// How many leading bytes are inspected when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 8000;

/// Scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// File extensions to index (without the dot)
    pub extensions: Vec<String>,
    /// Extra glob patterns to exclude, relative to the root
    pub exclude: Vec<String>,
    /// Whether to respect .gitignore
    pub respect_gitignore: bool,
    /// Files larger than this are skipped
    pub max_file_bytes: u64,
    /// Name of the state directory, always excluded
    pub state_dir: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: ["rs", "py", "js", "jsx", "ts", "tsx", "go"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude: Vec::new(),
            respect_gitignore: true,
            max_file_bytes: 1024 * 1024,
            state_dir: crate::DEFAULT_STATE_DIR.to_string(),
        }
    }
}

/// Decides which files are eligible for indexing.
#[derive(Debug, Clone)]
pub struct FileFilter {
    config: ScanConfig,
    overrides: Override,
}

impl FileFilter {
    /// Build a filter for the given root. Exclude globs are compiled once here.
    pub fn new(root: &Path, config: ScanConfig) -> Result<Self> {
        let mut builder = OverrideBuilder::new(root);
        for pattern in &config.exclude {
            builder
                .add(&format!("!{}", pattern))
                .map_err(|e| IndexError::Config(format!("bad exclude glob {:?}: {}", pattern, e)))?;
        }
        let overrides = builder
            .build()
            .map_err(|e| IndexError::Config(format!("bad exclude globs: {}", e)))?;

        Ok(Self { config, overrides })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Check a repo-relative, `/`-separated path against extension,
    /// excluded directories and exclude globs. Does not touch the disk.
    pub fn is_eligible(&self, rel_path: &str) -> bool {
        let path = Path::new(rel_path);

        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.config.extensions.iter().any(|allowed| allowed == ext))
            .unwrap_or(false);
        if !ext_ok {
            return false;
        }

        let in_excluded_dir = path.components().any(|c| match c {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                EXCLUDED_DIRS.contains(&name.as_ref()) || name == self.config.state_dir
            }
            _ => false,
        });
        if in_excluded_dir {
            return false;
        }

        !self.overrides.matched(path, false).is_ignore()
    }

    /// Whether a file of this size is within the configured ceiling.
    pub fn within_size(&self, len: u64) -> bool {
        len <= self.config.max_file_bytes
    }

    /// Walk the tree under `root` and return eligible files as sorted,
    /// repo-relative paths.
    pub fn scan(&self, root: &Path) -> Result<Vec<String>> {
        let walker = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .require_git(false)
            .overrides(self.overrides.clone())
            .build();

        let mut files = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(rel) = relative_path(root, entry.path()) else {
                continue;
            };
            if !self.is_eligible(&rel) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) if !self.within_size(meta.len()) => {
                    debug!("Skipping {} ({} bytes over size ceiling)", rel, meta.len());
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Skipping {}: {}", rel, e);
                    continue;
                }
            }
            files.push(rel);
        }

        files.sort();
        Ok(files)
    }
}

/// NUL byte in the leading window marks a file as binary.
pub fn is_binary(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    window.contains(&0)
}

/// Express `path` relative to `root` with `/` separators.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
