//! Top-level error type of the crate
//!
//! Each subsystem owns a thiserror enum; [`RagError`] gathers them so
//! callers crossing subsystem boundaries can use a single `?`.

use std::path::PathBuf;
use thiserror::Error;

use crate::answers::AnswerError;
use crate::cache::CacheError;
use crate::index::{IndexError, PoolError};
use crate::semantic::BucketingError;
use crate::vector::EmbeddingError;

#[derive(Error, Debug)]
pub enum RagError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Bucketing(#[from] BucketingError),

    #[error(transparent)]
    Answer(#[from] AnswerError),

    /// Configuration errors
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Failed to read input '{path}': {source}")]
    Input {
        path: PathBuf,
        source: std::io::Error,
    },

    /// General errors carrying their own context
    #[error("{0}")]
    General(String),
}

impl RagError {
    /// Get a stable status code for this error type.
    pub fn status_code(&self) -> String {
        match self {
            Self::Cache(_) => "CACHE_ERROR",
            Self::Embedding(EmbeddingError::PrivateViolation { .. }) => "PRIVATE_VIOLATION",
            Self::Embedding(EmbeddingError::MissingApiKey { .. }) => "MISSING_API_KEY",
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::Index(IndexError::CostDeclined { .. }) => "COST_DECLINED",
            Self::Index(IndexError::MissingContentHash { .. }) => "MISSING_CONTENT_HASH",
            Self::Index(IndexError::NoDocuments) => "NO_DOCUMENTS",
            Self::Index(IndexError::Pool(_)) | Self::Pool(_) => "POOL_ERROR",
            Self::Index(_) => "INDEX_ERROR",
            Self::Bucketing(_) => "BUCKETING_ERROR",
            Self::Answer(_) => "ANSWER_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Input { .. } => "INPUT_ERROR",
            Self::General(_) => "GENERAL_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Index(IndexError::CostDeclined { .. }) => vec![
                "Switch to a local model such as 'fastembed/AllMiniLML6V2'",
                "Raise cost.dollar_limit or pass --yes to accept the cost",
            ],
            Self::Index(IndexError::MissingContentHash { .. }) => vec![
                "Add a 'content_hash' metadata entry to every document",
                "The CLI fills missing hashes in automatically",
            ],
            Self::Index(IndexError::InvalidFormat { .. } | IndexError::Corrupt(_)) => vec![
                "Delete the damaged shard directory, it is rebuilt on the next run",
                "Run 'ragshard cache expire --days 0' to clear every shard",
            ],
            Self::Embedding(EmbeddingError::PrivateViolation { .. }) => vec![
                "Use a local fastembed or ollama model in private mode",
            ],
            Self::Embedding(EmbeddingError::MissingApiKey { .. }) => vec![
                "Export the API key in the variable named by embedding.api_key_env",
            ],
            Self::Embedding(_) => vec![
                "Check that the embedding backend is reachable",
                "Retry; transient failures are retried before the cache is bypassed",
            ],
            Self::Cache(_) => vec![
                "Check disk space and permissions of the cache directory",
            ],
            Self::Bucketing(BucketingError::SingleCluster) => vec![
                "Combine the texts in one pass without bucketing",
            ],
            Self::Config { .. } => vec![
                "Run 'ragshard init --force' to regenerate the configuration",
            ],
            _ => vec![],
        }
    }
}

/// Result type alias for crate operations
pub type RagResult<T> = Result<T, RagError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T, RagError>;

    /// Add context with a path
    fn with_path(self, path: &std::path::Path) -> Result<T, RagError>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, msg: &str) -> Result<T, RagError> {
        self.map_err(|e| RagError::General(format!("{msg}: {e}")))
    }

    fn with_path(self, path: &std::path::Path) -> Result<T, RagError> {
        self.map_err(|e| RagError::General(format!("Error processing '{}': {}", path.display(), e)))
    }
}
