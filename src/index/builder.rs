//! Embedding one batch of documents into an index shard.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::index::{IndexError, IndexShard, RelevanceScore};
use crate::types::{Document, DocumentId};
use crate::vector::{CachedEmbeddings, EmbeddingError, EmbeddingProvider, VectorDimension};

/// A built shard and how it was obtained.
#[derive(Debug)]
pub struct ShardBuildOutcome {
    pub shard: IndexShard,
    /// The batch was embedded by the wrapped provider after cached attempts failed
    pub bypassed_cache: bool,
    /// Failed cached attempts before success
    pub failed_attempts: usize,
}

/// Builds normalized shards, retrying through the cache before bypassing it.
#[derive(Clone)]
pub struct ShardBuilder {
    embeddings: Arc<CachedEmbeddings>,
    relevance: RelevanceScore,
    retry_attempts: usize,
    retry_backoff: Duration,
}

impl ShardBuilder {
    pub fn new(embeddings: Arc<CachedEmbeddings>, relevance: RelevanceScore) -> Self {
        Self {
            embeddings,
            relevance,
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_retries(mut self, attempts: usize, backoff: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff = backoff;
        self
    }

    /// Embeds `batch` into one shard keyed by content hash.
    pub fn build(&self, batch: &[Document]) -> Result<ShardBuildOutcome, IndexError> {
        if batch.is_empty() {
            return Err(IndexError::NoDocuments);
        }
        let ids = batch
            .iter()
            .enumerate()
            .map(|(position, doc)| {
                doc.content_hash()
                    .map(DocumentId::new)
                    .ok_or(IndexError::MissingContentHash { position })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for attempt in 1..=self.retry_attempts {
            match self.try_build(self.embeddings.as_ref(), &ids, batch) {
                Ok(shard) => {
                    return Ok(ShardBuildOutcome {
                        shard,
                        bypassed_cache: false,
                        failed_attempts: attempt - 1,
                    });
                }
                Err(e) => {
                    warn!(
                        target: "ragshard::index",
                        "Error at trial {attempt}/{} when embedding {} documents: {e}",
                        self.retry_attempts,
                        batch.len()
                    );
                    if attempt < self.retry_attempts {
                        thread::sleep(self.retry_backoff);
                    }
                }
            }
        }

        warn!(target: "ragshard::index", "Too many errors: bypassing the cache for {} documents", batch.len());
        let underlying = self.embeddings.underlying();
        let shard = self.try_build(underlying.as_ref(), &ids, batch)?;
        info!(target: "ragshard::index", "Batch of {} documents embedded without cache", batch.len());
        Ok(ShardBuildOutcome {
            shard,
            bypassed_cache: true,
            failed_attempts: self.retry_attempts,
        })
    }

    fn try_build(
        &self,
        provider: &dyn EmbeddingProvider,
        ids: &[DocumentId],
        batch: &[Document],
    ) -> Result<IndexShard, IndexError> {
        let texts: Vec<&str> = batch.iter().map(|d| d.page_content.as_str()).collect();

        let vectors = provider.embed_documents(&texts)?;
        if vectors.len() != batch.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: batch.len(),
                actual: vectors.len(),
            }
            .into());
        }
        let dimension = VectorDimension::new(vectors[0].len())?;

        IndexShard::from_embeddings(
            dimension,
            ids.iter()
                .cloned()
                .zip(batch.iter().cloned())
                .zip(vectors)
                .map(|((id, doc), vector)| (id, doc, vector)),
            self.relevance,
            true,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LocalFileStore, StoreOptions};
    use crate::types::content_hash;
    use crate::vector::MockEmbeddingProvider;
    use tempfile::TempDir;

    fn docs(texts: &[&str]) -> Vec<Document> {
        texts
            .iter()
            .map(|t| Document::new(*t).with_metadata("content_hash", content_hash(t)))
            .collect()
    }

    fn builder(
        temp_dir: &TempDir,
        provider: Arc<MockEmbeddingProvider>,
        attempts: usize,
    ) -> ShardBuilder {
        let store = Arc::new(LocalFileStore::open(temp_dir.path(), StoreOptions::default()).unwrap());
        let cached = Arc::new(CachedEmbeddings::new(provider, store, "mock"));
        ShardBuilder::new(cached, RelevanceScore::Linear)
            .with_retries(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_build_keys_by_content_hash() {
        let temp_dir = TempDir::new().unwrap();
        let provider = Arc::new(MockEmbeddingProvider::new(8));
        let outcome = builder(&temp_dir, provider, 3)
            .build(&docs(&["one", "two"]))
            .unwrap();

        assert!(!outcome.bypassed_cache);
        assert_eq!(outcome.failed_attempts, 0);
        assert_eq!(outcome.shard.len(), 2);
        assert_eq!(outcome.shard.ids()[0].as_str(), content_hash("one"));
        let norm: f32 = outcome.shard.vector(1).unwrap().iter().map(|x| x * x).sum();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let temp_dir = TempDir::new().unwrap();
        let provider = Arc::new(MockEmbeddingProvider::new(8).with_failures(2));
        let outcome = builder(&temp_dir, provider.clone(), 3)
            .build(&docs(&["one"]))
            .unwrap();

        assert!(!outcome.bypassed_cache);
        assert_eq!(outcome.failed_attempts, 2);
        assert_eq!(provider.calls(), 3);
    }

    #[test]
    fn test_cache_bypassed_after_retries() {
        let temp_dir = TempDir::new().unwrap();
        let provider = Arc::new(MockEmbeddingProvider::new(8).with_failures(3));
        let outcome = builder(&temp_dir, provider.clone(), 3)
            .build(&docs(&["one", "two"]))
            .unwrap();

        assert!(outcome.bypassed_cache);
        assert_eq!(outcome.shard.len(), 2);
        assert_eq!(provider.calls(), 4);
    }

    #[test]
    fn test_persistent_failure_propagates() {
        let temp_dir = TempDir::new().unwrap();
        let provider = Arc::new(MockEmbeddingProvider::new(8).with_failures(10));
        let err = builder(&temp_dir, provider, 2)
            .build(&docs(&["one"]))
            .unwrap_err();
        assert!(matches!(err, IndexError::Embedding(_)));
    }

    #[test]
    fn test_missing_content_hash() {
        let temp_dir = TempDir::new().unwrap();
        let provider = Arc::new(MockEmbeddingProvider::new(8));
        let err = builder(&temp_dir, provider, 1)
            .build(&[Document::new("no hash")])
            .unwrap_err();
        assert!(matches!(err, IndexError::MissingContentHash { position: 0 }));
    }
}
