//! Sharded exact similarity index.
//!
//! Documents are embedded in batches into [`IndexShard`]s, persisted one
//! document per shard directory, merged into a single index and served
//! through a [`SearchGuard`]. [`IndexPipeline`] drives the whole build.

mod builder;
mod cost;
mod guard;
mod merge;
mod pipeline;
mod pool;
mod shard;
mod storage;
mod workers;

pub use builder::{ShardBuildOutcome, ShardBuilder};
pub use cost::{
    AlwaysConfirm, Confirmation, CostEstimate, NeverConfirm, StdinConfirmation, estimate_cost,
    price_per_token,
};
pub use guard::{SearchGuard, SearchHit};
pub use merge::{MergeOutcome, merge_all, merge_into};
pub use pipeline::{BuildReport, IndexPipeline};
pub use pool::{Job, PoolConfig, PoolError, PoolShutdown, Reply, Worker, WorkerPool};
pub use shard::{IndexShard, RawHit, RelevanceScore};
pub use storage::{DOCSTORE_FILE, VECTORS_FILE, shard_path};
pub use workers::{LoadJob, SaveJob, ShardLoader, ShardSaver};

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cache::CacheError;
use crate::types::DocumentId;
use crate::vector::{EmbeddingError, VectorError};

/// Errors raised while building, merging, persisting or loading indexes.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index I/O failed at '{path}': {source}\nSuggestion: Check disk space and file permissions")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid shard format at '{path}': {reason}\nSuggestion: Delete the shard so it is rebuilt")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Shard format version {actual} is not supported (expected {expected})")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Corrupt index: {0}")]
    Corrupt(String),

    #[error(
        "Index dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all shards use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{} document id(s) already present in the index", ids.len())]
    DuplicateIds { ids: Vec<DocumentId> },

    #[error(
        "Document #{position} has no 'content_hash' metadata\nSuggestion: Compute it with types::content_hash(page_content)"
    )]
    MissingContentHash { position: usize },

    #[error("Embedding cost of ${dollars:.6} was declined")]
    CostDeclined { dollars: f64 },

    #[error("Unknown relevance function '{0}'\nSuggestion: Use 'linear', 'quadratic' or 'exponential'")]
    InvalidRelevance(String),

    #[error("Nothing to index: no documents were given")]
    NoDocuments,

    #[error("Failed to start embedding threads: {0}")]
    ThreadPool(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl IndexError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
