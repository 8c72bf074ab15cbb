//! Semantic bucketing of intermediate answers.
//!
//! Texts are embedded, clustered hierarchically and packed into
//! token-bounded buckets so that related answers are combined together.

mod bucketing;
pub mod linalg;
mod linkage;

pub use bucketing::SemanticBucketer;
pub use linkage::{Dendrogram, Merge};

use thiserror::Error;

use crate::vector::EmbeddingError;

/// Errors raised while bucketing texts.
#[derive(Error, Debug)]
pub enum BucketingError {
    #[error("No input text received")]
    EmptyInput,

    #[error(
        "Embeddings have only {dimension} dimension(s)\nSuggestion: Use a real embedding model for bucketing"
    )]
    DegenerateEmbeddings { dimension: usize },

    #[error(
        "All texts fell into a single cluster\nSuggestion: Combine the texts without bucketing"
    )]
    SingleCluster,

    #[error("Bucketing produced an invalid result: {0}")]
    Invariant(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}
