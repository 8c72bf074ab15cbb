//! Embedding cache, sharded similarity index and semantic bucketing for
//! retrieval-augmented generation pipelines.

pub mod answers;
pub mod cache;
pub mod config;
pub mod display;
pub mod error;
pub mod index;
pub mod semantic;
pub mod tokens;
pub mod types;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{ErrorContext, RagError, RagResult};
pub use index::{BuildReport, IndexError, IndexPipeline, IndexShard, SearchGuard, SearchHit};
pub use semantic::{BucketingError, SemanticBucketer};
pub use types::{Document, DocumentId, content_hash};
pub use vector::{CachedEmbeddings, EmbeddingError, EmbeddingProvider, create_provider};
