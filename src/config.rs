//! Configuration module for the embedding cache and index builder.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `RAGSHARD_` and use double
//! underscores to separate nested levels:
//! - `RAGSHARD_INDEX__BATCH_SIZE=200` sets `index.batch_size`
//! - `RAGSHARD_EMBEDDING__MODEL=openai/text-embedding-3-small` sets `embedding.model`
//! - `RAGSHARD_COST__DOLLAR_LIMIT=1.5` sets `cost.dollar_limit`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::index::{PoolConfig, RelevanceScore};
use crate::vector::Pooling;

const CONFIG_DIR: &str = ".ragshard";
const CONFIG_FILE: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Root of the embedding cache and the shard store
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Global debug mode
    #[serde(default = "default_false")]
    pub debug: bool,

    /// Embedding model settings
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Index building settings
    #[serde(default)]
    pub index: IndexConfig,

    /// Loader and saver thread pools
    #[serde(default)]
    pub pools: PoolSettings,

    /// Byte cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Embedding cost guard
    #[serde(default)]
    pub cost: CostConfig,

    /// Semantic bucketing of intermediate answers
    #[serde(default)]
    pub bucketing: BucketingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    /// `backend/model`, e.g. `fastembed/AllMiniLML6V2` or `openai/text-embedding-3-small`
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Prefix documents and queries with retrieval instructions
    #[serde(default = "default_false")]
    pub instruct: bool,

    /// Refuse hosted backends
    #[serde(default = "default_false")]
    pub private: bool,

    /// Requested output dimension for models that support it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,

    /// Base URL of the HTTP backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Environment variable holding the API key of hosted backends
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Embed long texts as pooled overlapping windows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_window: Option<RollingWindowConfig>,

    /// Cache query embeddings too
    #[serde(default = "default_false")]
    pub cache_queries: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct RollingWindowConfig {
    pub max_tokens: usize,
    #[serde(default)]
    pub pooling: Pooling,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexConfig {
    /// Documents embedded per shard
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Threads embedding batches in parallel (capped at the CPU count)
    #[serde(default = "default_embed_threads")]
    pub embed_threads: usize,

    /// Shuffle the documents when at least this many are indexed
    #[serde(default = "default_shuffle_threshold")]
    pub shuffle_threshold: usize,

    /// Cached embedding attempts per batch before bypassing the cache
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    /// Pause between attempts, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Distance to relevance mapping stored in the index
    #[serde(default)]
    pub relevance: RelevanceScore,

    /// Re-queries the search guard may issue
    #[serde(default = "default_search_retries")]
    pub search_retries: usize,

    /// Save the merged index here after building
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_embeds_as: Option<PathBuf>,

    /// Load a saved merged index instead of building one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_embeds_from: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolSettings {
    #[serde(default = "default_pool_workers")]
    pub loader_workers: usize,

    #[serde(default = "default_pool_workers")]
    pub saver_workers: usize,

    /// Inbound queue bound per worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Seconds between liveness logs while waiting on a worker
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Upper bound on a pool shutdown, in seconds
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    /// LZ4-compress cached vectors
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Delete cache entries and shards unused for this many days
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_days: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CostConfig {
    /// Ask before spending more than this many dollars
    #[serde(default = "default_dollar_limit")]
    pub dollar_limit: f64,

    /// Override of the built-in price table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_per_token: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BucketingConfig {
    /// Below this many texts everything goes into one bucket
    #[serde(default = "default_min_texts")]
    pub min_texts: usize,

    /// Token budget of one bucket
    #[serde(default = "default_bucket_tokens")]
    pub max_tokens: usize,

    /// Reduce embeddings with PCA above this dimension
    #[serde(default = "default_max_dimensions")]
    pub max_dimensions: usize,

    /// Warn when PCA keeps less variance than this
    #[serde(default = "default_variance_target")]
    pub variance_target: f64,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("ragshard"))
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("cache"))
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_embedding_model() -> String {
    "fastembed/AllMiniLML6V2".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    1000
}
fn default_embed_threads() -> usize {
    5
}
fn default_shuffle_threshold() -> usize {
    50
}
fn default_retry_attempts() -> usize {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_search_retries() -> usize {
    10
}
fn default_pool_workers() -> usize {
    10
}
fn default_queue_capacity() -> usize {
    10
}
fn default_poll_timeout_secs() -> u64 {
    10
}
fn default_join_timeout_secs() -> u64 {
    600
}
fn default_dollar_limit() -> f64 {
    5.0
}
fn default_min_texts() -> usize {
    5
}
fn default_bucket_tokens() -> usize {
    500
}
fn default_max_dimensions() -> usize {
    100
}
fn default_variance_target() -> f64 {
    0.95
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            cache_dir: default_cache_dir(),
            debug: false,
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            pools: PoolSettings::default(),
            cache: CacheConfig::default(),
            cost: CostConfig::default(),
            bucketing: BucketingConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            instruct: false,
            private: false,
            dimensions: None,
            endpoint: None,
            api_key_env: default_api_key_env(),
            rolling_window: None,
            cache_queries: false,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            embed_threads: default_embed_threads(),
            shuffle_threshold: default_shuffle_threshold(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            relevance: RelevanceScore::default(),
            search_retries: default_search_retries(),
            save_embeds_as: None,
            load_embeds_from: None,
        }
    }
}

impl IndexConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Embedding threads, at least one and at most one per CPU.
    pub fn effective_embed_threads(&self) -> usize {
        self.embed_threads.clamp(1, num_cpus::get().max(1))
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            loader_workers: default_pool_workers(),
            saver_workers: default_pool_workers(),
            queue_capacity: default_queue_capacity(),
            poll_timeout_secs: default_poll_timeout_secs(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl PoolSettings {
    /// Pool sizing for `workers` threads with the shared queue and timeouts.
    pub fn pool_config(&self, workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            capacity: self.queue_capacity.max(1),
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compress: true,
            expire_days: None,
        }
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            dollar_limit: default_dollar_limit(),
            price_per_token: None,
        }
    }
}

impl Default for BucketingConfig {
    fn default() -> Self {
        Self {
            min_texts: default_min_texts(),
            max_tokens: default_bucket_tokens(),
            max_dimensions: default_max_dimensions(),
            variance_target: default_variance_target(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::figment(config_path).extract().map_err(Box::new)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref().to_path_buf())
            .extract()
            .map_err(Box::new)
    }

    fn figment(config_path: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // Double underscore separates nesting levels, single ones stay in field names
            .merge(Env::prefixed("RAGSHARD_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Find `.ragshard/settings.toml` in the current directory or an ancestor
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        Self::init_config_file_in(Path::new("."), force)
    }

    pub(crate) fn init_config_file_in(
        root: &Path,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = root.join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# ragshard configuration file

# Version of the configuration schema
version = 1

# Embedding cache and shard store
cache_dir = "{}"

# Global debug mode
debug = false

[embedding]
# backend/model: fastembed/<name>, openai/<name> or ollama/<name>
model = "fastembed/AllMiniLML6V2"

# Prefix documents and queries with retrieval instructions
instruct = false

# Refuse hosted backends
private = false

# Environment variable with the API key of hosted backends
api_key_env = "OPENAI_API_KEY"

# Cache query embeddings too
cache_queries = false

# Embed long texts as pooled overlapping windows
# [embedding.rolling_window]
# max_tokens = 256
# pooling = "mean"

[index]
# Documents embedded per shard
batch_size = 1000

# Threads embedding batches in parallel (capped at {} on this machine)
embed_threads = 5

# Shuffle the documents when at least this many are indexed
shuffle_threshold = 50

# Cached attempts per batch before the cache is bypassed
retry_attempts = 3
retry_backoff_ms = 1000

# Distance to score mapping: "linear", "quadratic" or "exponential"
relevance = "linear"

# Re-queries allowed when the index returns unknown ids
search_retries = 10

# save_embeds_as = "merged.shard"
# load_embeds_from = "merged.shard"

[pools]
loader_workers = 10
saver_workers = 10
queue_capacity = 10
poll_timeout_secs = 10
join_timeout_secs = 600

[cache]
compress = true
# expire_days = 30

[cost]
# Ask for confirmation above this many dollars
dollar_limit = 5.0
# price_per_token = 2e-8

[bucketing]
min_texts = 5
max_tokens = 500
max_dimensions = 100
variance_target = 0.95
"#,
            default_cache_dir().display(),
            num_cpus::get()
        );

        std::fs::write(&config_path, template)?;

        if force {
            println!("Overwrote configuration at: {}", config_path.display());
        } else {
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
        }

        Ok(config_path)
    }

    /// Directory of downloaded local embedding models
    pub fn models_dir(&self) -> PathBuf {
        self.cache_dir.join("models")
    }

    /// Byte cache directory of one model namespace
    pub fn embeddings_dir(&self, namespace: &str) -> PathBuf {
        self.cache_dir.join("embeddings").join(namespace)
    }

    /// Shard directory of one model namespace
    pub fn shards_dir(&self, namespace: &str) -> PathBuf {
        self.cache_dir.join("shards").join(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.embedding.model, "fastembed/AllMiniLML6V2");
        assert_eq!(settings.index.batch_size, 1000);
        assert_eq!(settings.index.relevance, RelevanceScore::Linear);
        assert_eq!(settings.pools.loader_workers, 10);
        assert_eq!(settings.cost.dollar_limit, 5.0);
        assert_eq!(settings.bucketing.max_tokens, 500);
        assert!(settings.cache.compress);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
version = 2

[embedding]
model = "openai/text-embedding-3-small"
instruct = true

[embedding.rolling_window]
max_tokens = 128
pooling = "max"

[index]
batch_size = 50
relevance = "exponential"

[cost]
dollar_limit = 0.5
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.version, 2);
        assert_eq!(settings.embedding.model, "openai/text-embedding-3-small");
        assert!(settings.embedding.instruct);
        assert_eq!(
            settings.embedding.rolling_window,
            Some(RollingWindowConfig {
                max_tokens: 128,
                pooling: Pooling::Max
            })
        );
        assert_eq!(settings.index.batch_size, 50);
        assert_eq!(settings.index.relevance, RelevanceScore::Exponential);
        assert_eq!(settings.cost.dollar_limit, 0.5);
        // Untouched sections keep their defaults
        assert_eq!(settings.index.embed_threads, 5);
        assert_eq!(settings.pools.join_timeout_secs, 600);
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("settings.toml");

        let mut settings = Settings::default();
        settings.index.batch_size = 2;
        settings.cache.expire_days = Some(7);

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.index.batch_size, 2);
        assert_eq!(loaded.cache.expire_days, Some(7));
    }

    #[test]
    fn test_init_template_parses() {
        let temp_dir = TempDir::new().unwrap();
        let path = Settings::init_config_file_in(temp_dir.path(), false).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.index.search_retries, 10);
        assert!(Settings::init_config_file_in(temp_dir.path(), false).is_err());
        assert!(Settings::init_config_file_in(temp_dir.path(), true).is_ok());
    }

    #[test]
    fn test_pool_config_and_paths() {
        let mut settings = Settings::default();
        settings.cache_dir = PathBuf::from("/tmp/rs");
        settings.pools.poll_timeout_secs = 2;

        let pool = settings.pools.pool_config(3);
        assert_eq!(pool.workers, 3);
        assert_eq!(pool.poll_timeout, Duration::from_secs(2));
        assert_eq!(
            settings.shards_dir("fastembed_AllMiniLML6V2"),
            PathBuf::from("/tmp/rs/shards/fastembed_AllMiniLML6V2")
        );
        assert_eq!(
            settings.embeddings_dir("x"),
            PathBuf::from("/tmp/rs/embeddings/x")
        );
        assert!(settings.index.effective_embed_threads() >= 1);
    }

    #[test]
    fn test_env_override() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        fs::write(&config_path, "[bucketing]\nmin_texts = 7\n").unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("RAGSHARD_BUCKETING__MAX_TOKENS", "123");
            let settings = Settings::load_from(&config_path).unwrap();
            assert_eq!(settings.bucketing.max_tokens, 123);
            assert_eq!(settings.bucketing.min_texts, 7);
            Ok(())
        });
    }
}
