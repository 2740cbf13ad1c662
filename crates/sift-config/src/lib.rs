//! Configuration for the sift indexer.
//!
//! Settings are layered, later sources winning:
//! 1. built-in defaults
//! 2. `<config dir>/sift/config.toml` (user-wide)
//! 3. `<repo>/.sift.toml` (per repository)
//! 4. environment variables with the `SIFT__` prefix, e.g.
//!    `SIFT__EMBEDDINGS__MODEL=...`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-repository config file name.
pub const PROJECT_CONFIG_FILE: &str = ".sift.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SIFT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Environment variable '{var}' not set (from config value '{value}')")]
    MissingSecret { var: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub embeddings: EmbeddingsConfig,
    pub batching: BatchingConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub freshness: FreshnessConfig,
}

/// What gets indexed and how the work is split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// State directory, relative to the repository root unless absolute
    pub state_dir: String,
    pub extensions: Vec<String>,
    /// Extra glob patterns to skip
    pub exclude: Vec<String>,
    pub respect_gitignore: bool,
    pub max_file_bytes: u64,
    /// Concurrent file reads and extractions
    pub workers: usize,
    pub files_per_batch: usize,
    /// Entity representations to embed: "metadata" and/or "full"
    pub variants: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            state_dir: ".sift".to_string(),
            extensions: ["rs", "py", "js", "jsx", "ts", "tsx", "go"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude: Vec::new(),
            respect_gitignore: true,
            max_file_bytes: 1024 * 1024,
            workers: 4,
            files_per_batch: 16,
            variants: vec!["metadata".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub provider: String,
    /// Literal key or `${ENV_VAR}` reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Provider's hard limit on texts per request
    pub max_batch_size: usize,
    /// In-flight embedding requests
    pub max_concurrency: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: "openrouter".to_string(),
            api_key: Some("${OPENROUTER_API_KEY}".to_string()),
            model: "qwen/qwen3-embedding-8b".to_string(),
            dimensions: 4096,
            base_url: None,
            max_batch_size: 32,
            max_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub initial_size: usize,
    pub min_size: usize,
    pub growth_factor: f64,
    pub shrink_factor: f64,
    pub latency_ceiling_ms: u64,
    pub memory_ceiling_bytes: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            initial_size: 8,
            min_size: 1,
            growth_factor: 2.0,
            shrink_factor: 0.5,
            latency_ceiling_ms: 10_000,
            memory_ceiling_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per embedding batch, including the first
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            call_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub qdrant_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qdrant_api_key: Option<String>,
    pub collection_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            collection_name: "sift-codebase".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Age in seconds after which the index counts as stale; 0 disables
    pub max_age_secs: u64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 24 * 60 * 60,
        }
    }
}

impl Config {
    /// Load the layered configuration for the repository at `repo_root`.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(user) = user_config_path() {
            builder = builder.add_source(config::File::from(user).required(false));
        }

        let config: Config = builder
            .add_source(config::File::from(repo_root.join(PROJECT_CONFIG_FILE)).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load a single TOML file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration to `path`.
    pub fn write_default(path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.embeddings.dimensions == 0 {
            return Err(invalid("embeddings.dimensions must be greater than 0"));
        }
        if self.embeddings.max_batch_size == 0 {
            return Err(invalid("embeddings.max_batch_size must be greater than 0"));
        }
        if self.index.workers == 0 {
            return Err(invalid("index.workers must be greater than 0"));
        }
        if self.index.files_per_batch == 0 {
            return Err(invalid("index.files_per_batch must be greater than 0"));
        }
        if self.index.variants.is_empty() {
            return Err(invalid("index.variants must name at least one variant"));
        }
        if let Some(unknown) = self
            .index
            .variants
            .iter()
            .find(|v| !matches!(v.as_str(), "metadata" | "full"))
        {
            return Err(invalid(&format!(
                "index.variants: unknown variant '{}' (expected \"metadata\" or \"full\")",
                unknown
            )));
        }
        if self.batching.min_size == 0 || self.batching.min_size > self.batching.initial_size {
            return Err(invalid(
                "batching.min_size must be at least 1 and not above batching.initial_size",
            ));
        }
        if !(self.batching.shrink_factor > 0.0 && self.batching.shrink_factor < 1.0) {
            return Err(invalid("batching.shrink_factor must be between 0 and 1"));
        }
        if self.batching.growth_factor <= 1.0 {
            return Err(invalid("batching.growth_factor must be greater than 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Maximum index age, `None` when the time signal is disabled.
    pub fn max_age_secs(&self) -> Option<u64> {
        match self.freshness.max_age_secs {
            0 => None,
            secs => Some(secs),
        }
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

/// `<config dir>/sift/config.toml`, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sift").join("config.toml"))
}

/// Resolve a configured secret, expanding `${ENV_VAR}` references.
/// Unset or empty values resolve to `None`.
pub fn resolve_secret(value: Option<&str>) -> Result<Option<String>> {
    match value {
        Some(raw) if !raw.trim().is_empty() => shellexpand::env(raw)
            .map(|expanded| Some(expanded.into_owned()))
            .map_err(|e| ConfigError::MissingSecret {
                var: e.var_name,
                value: raw.to_string(),
            }),
        _ => Ok(None),
    }
}

/// Expand a leading `~` in a configured path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.index.state_dir, ".sift");
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.max_age_secs(), Some(86_400));
    }

    #[test]
    fn test_from_file_keeps_defaults_for_missing_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sift.toml");
        fs::write(
            &path,
            r#"
[embeddings]
model = "text-embedding-3-small"
dimensions = 1536

[freshness]
max_age_secs = 0
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.embeddings.model, "text-embedding-3-small");
        assert_eq!(config.embeddings.dimensions, 1536);
        assert_eq!(config.embeddings.max_batch_size, 32);
        assert_eq!(config.index.files_per_batch, 16);
        assert_eq!(config.max_age_secs(), None);
    }

    #[test]
    fn test_project_file_and_env_override_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            "[index]\nworkers = 3\nfiles_per_batch = 4\n",
        )
        .unwrap();

        // SAFETY: unique variable, removed before the test returns
        unsafe {
            std::env::set_var("SIFT__STORE__COLLECTION_NAME", "from-env");
        }
        let config = Config::load(dir.path());
        unsafe {
            std::env::remove_var("SIFT__STORE__COLLECTION_NAME");
        }

        let config = config.unwrap();
        assert_eq!(config.index.workers, 3);
        assert_eq!(config.index.files_per_batch, 4);
        assert_eq!(config.store.collection_name, "from-env");
        assert_eq!(config.store.qdrant_url, "http://localhost:6334");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.batching.shrink_factor = 1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.batching.min_size = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.index.variants = vec!["summary".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("summary"));

        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Config::write_default(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_resolve_secret() {
        assert_eq!(resolve_secret(Some("direct-key")).unwrap(), Some("direct-key".to_string()));
        assert_eq!(resolve_secret(Some("  ")).unwrap(), None);
        assert_eq!(resolve_secret(None).unwrap(), None);

        // SAFETY: unique variable, removed below
        unsafe {
            std::env::set_var("SIFT_TEST_SECRET_4821", "from-env");
        }
        let resolved = resolve_secret(Some("${SIFT_TEST_SECRET_4821}")).unwrap();
        unsafe {
            std::env::remove_var("SIFT_TEST_SECRET_4821");
        }
        assert_eq!(resolved, Some("from-env".to_string()));

        let err = resolve_secret(Some("${SIFT_TEST_SECRET_MISSING_9917}")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret { ref var, .. } if var == "SIFT_TEST_SECRET_MISSING_9917"));
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/tmp/x"), PathBuf::from("/tmp/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/idx"), home.join("idx"));
        }
    }
}
