//! Embedding generation behind one provider capability.
//!
//! Every backend, decorator and cache layer implements [`EmbeddingProvider`],
//! so they stack freely: `CachedEmbeddings<RollingWindow<Instructed<FastEmbedProvider>>>`
//! looks the same to callers as a bare backend.

use std::path::Path;
use std::sync::Arc;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::CacheError;
use crate::vector::VectorDimension;

/// Prefix applied to documents when instruction mode is on.
pub const DEFAULT_EMBED_INSTRUCTION: &str = "Represent the document for retrieval: ";

/// Prefix applied to queries when instruction mode is on.
pub const DEFAULT_QUERY_INSTRUCTION: &str =
    "Represent the question for retrieving supporting documents: ";

/// Errors raised while producing embeddings.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding generation failed: {0}\nSuggestion: Verify the embedding backend is reachable and the model is initialized")]
    Provider(String),

    #[error("Embedding API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error(
        "Provider returned {actual} embeddings for {expected} inputs\nSuggestion: The backend dropped inputs; retry with a smaller batch"
    )]
    CountMismatch { expected: usize, actual: usize },

    #[error(
        "Embedding dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all vectors use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding sanity check failed: {0}")]
    SanityCheck(String),

    #[error(
        "Private mode forbids the hosted backend '{backend}'\nSuggestion: Use a local model such as 'fastembed/AllMiniLML6V2' or disable private mode"
    )]
    PrivateViolation { backend: String },

    #[error(
        "Environment variable '{var}' is not set\nSuggestion: Export the API key or change embedding.api_key_env"
    )]
    MissingApiKey { var: String },

    #[error(
        "Unknown embedding backend '{0}'\nSuggestion: Use one of 'fastembed', 'openai' or 'ollama' as the model prefix"
    )]
    UnknownBackend(String),

    #[error("Unknown embedding model '{0}'")]
    UnknownModel(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Failed to encode embedding: {0}")]
    Encode(String),
}

/// Capability of turning texts into vectors.
///
/// Implementations must be thread-safe; the index pipeline calls them from
/// a rayon pool.
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds a batch of documents, one vector per input in input order.
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embeds a single search query.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let vectors = self.embed_documents(&[text])?;
        let actual = vectors.len();
        vectors
            .into_iter()
            .next()
            .ok_or(EmbeddingError::CountMismatch {
                expected: 1,
                actual,
            })
    }

    /// Identifier of the underlying model.
    fn model_name(&self) -> &str;
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Arc<P> {
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        (**self).embed_documents(texts)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed_query(text)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Fails unless `vectors` holds exactly `expected` entries.
pub(crate) fn ensure_count(
    vectors: Vec<Vec<f32>>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if vectors.len() != expected {
        return Err(EmbeddingError::CountMismatch {
            expected,
            actual: vectors.len(),
        });
    }
    Ok(vectors)
}

/// Maps a short model name onto a fastembed model and its output dimension.
pub fn parse_fastembed_model(name: &str) -> Result<(EmbeddingModel, VectorDimension), EmbeddingError> {
    let (model, dim) = match name {
        "AllMiniLML6V2" | "all-MiniLM-L6-v2" => (EmbeddingModel::AllMiniLML6V2, 384),
        "AllMiniLML12V2" | "all-MiniLM-L12-v2" => (EmbeddingModel::AllMiniLML12V2, 384),
        "BGESmallENV15" | "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
        "BGEBaseENV15" | "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
        "BGELargeENV15" | "bge-large-en-v1.5" => (EmbeddingModel::BGELargeENV15, 1024),
        "MultilingualE5Small" | "multilingual-e5-small" => {
            (EmbeddingModel::MultilingualE5Small, 384)
        }
        "NomicEmbedTextV15" | "nomic-embed-text-v1.5" => (EmbeddingModel::NomicEmbedTextV15, 768),
        other => return Err(EmbeddingError::UnknownModel(other.to_string())),
    };
    let dimension =
        VectorDimension::new(dim).map_err(|e| EmbeddingError::Provider(e.to_string()))?;
    Ok((model, dimension))
}

/// Local ONNX sentence embeddings through fastembed.
///
/// The model session is not reentrant, so calls serialize on a mutex.
pub struct FastEmbedProvider {
    model: Mutex<TextEmbedding>,
    name: String,
    dimension: VectorDimension,
}

impl FastEmbedProvider {
    /// Loads (downloading on first use) the named model into `models_dir`.
    pub fn new(name: &str, models_dir: &Path, show_progress: bool) -> Result<Self, EmbeddingError> {
        let (model_kind, dimension) = parse_fastembed_model(name)?;
        let model = TextEmbedding::try_new(
            InitOptions::new(model_kind)
                .with_cache_dir(models_dir.to_path_buf())
                .with_show_download_progress(show_progress),
        )
        .map_err(|e| EmbeddingError::Provider(
            format!("Failed to initialize embedding model: {e}. Ensure you have internet connection for first-time model download")
        ))?;

        Ok(Self {
            model: Mutex::new(model),
            name: name.to_string(),
            dimension,
        })
    }

    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}

impl EmbeddingProvider for FastEmbedProvider {
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let text_strings: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();
        let embeddings = self
            .model
            .lock()
            .embed(text_strings, None)
            .map_err(|e| EmbeddingError::Provider(format!("Failed to generate embeddings: {e}")))?;

        for embedding in &embeddings {
            if embedding.len() != self.dimension.get() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension.get(),
                    actual: embedding.len(),
                });
            }
        }
        ensure_count(embeddings, texts.len())
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

/// Prefixes documents and queries with retrieval instructions.
pub struct Instructed<P> {
    inner: P,
    document_instruction: String,
    query_instruction: String,
}

impl<P: EmbeddingProvider> Instructed<P> {
    pub fn new(inner: P) -> Self {
        Self::with_instructions(inner, DEFAULT_EMBED_INSTRUCTION, DEFAULT_QUERY_INSTRUCTION)
    }

    pub fn with_instructions(inner: P, document: &str, query: &str) -> Self {
        Self {
            inner,
            document_instruction: document.to_string(),
            query_instruction: query.to_string(),
        }
    }
}

impl<P: EmbeddingProvider> EmbeddingProvider for Instructed<P> {
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let prefixed: Vec<String> = texts
            .iter()
            .map(|t| format!("{}{t}", self.document_instruction))
            .collect();
        let refs: Vec<&str> = prefixed.iter().map(String::as_str).collect();
        self.inner.embed_documents(&refs)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.inner
            .embed_query(&format!("{}{text}", self.query_instruction))
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Startup check that a provider produces usable vectors.
///
/// Embeds one query and one document; both must have the same length, must
/// differ, and must not be all zeros.
pub fn check_embeddings(provider: &dyn EmbeddingProvider) -> Result<(), EmbeddingError> {
    let query = provider.embed_query("This is a test")?;
    let document = provider
        .embed_documents(&["This is another test"])?
        .into_iter()
        .next()
        .ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            actual: 0,
        })?;

    if query.len() != document.len() {
        return Err(EmbeddingError::SanityCheck(format!(
            "query and document embeddings differ in length ({} vs {})",
            query.len(),
            document.len()
        )));
    }
    if query == document {
        return Err(EmbeddingError::SanityCheck(
            "query and document embeddings are identical".to_string(),
        ));
    }
    if query.iter().all(|v| *v == 0.0) || document.iter().all(|v| *v == 0.0) {
        return Err(EmbeddingError::SanityCheck(
            "embeddings are all zeros".to_string(),
        ));
    }
    Ok(())
}
