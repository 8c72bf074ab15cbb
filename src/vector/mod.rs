//! Embedding providers and the cache-through embedding engine.
//!
//! # Architecture
//! Backends ([`FastEmbedProvider`], [`OpenAiProvider`], [`OllamaProvider`])
//! implement [`EmbeddingProvider`]. Decorators ([`Instructed`],
//! [`RollingWindow`], [`CachedEmbeddings`]) implement it too and wrap
//! another provider, so a configured stack is just nested wrappers behind
//! an `Arc<dyn EmbeddingProvider>`.

mod backends;
mod cached;
mod embedding;
#[cfg(any(test, feature = "test-utils"))]
mod mock;
mod rolling;
mod types;

pub use backends::{
    EmbeddingBackend, ModelSpec, OllamaProvider, OpenAiProvider, create_provider,
};
pub use cached::{CacheStats, CachedEmbeddings};
pub use embedding::{
    DEFAULT_EMBED_INSTRUCTION, DEFAULT_QUERY_INSTRUCTION, EmbeddingError, EmbeddingProvider,
    FastEmbedProvider, Instructed, check_embeddings, parse_fastembed_model,
};
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockEmbeddingProvider;
pub use rolling::{Pooling, RollingWindow};
pub use types::{
    VECTOR_DIMENSION_384, VectorDimension, VectorError, l2_distance, normalize_l2,
};
