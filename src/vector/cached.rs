//! Cache-through embedding engine.
//!
//! [`CachedEmbeddings`] answers from a [`ByteStore`] where it can and sends
//! only the misses to the wrapped provider, in a single batched call.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bincode::config;
use tracing::{debug, warn};

use crate::cache::{ByteStore, CacheKey};
use crate::vector::{EmbeddingError, EmbeddingProvider};

/// Hit/miss counters of a [`CachedEmbeddings`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Embedding provider backed by a persistent byte cache.
pub struct CachedEmbeddings {
    underlying: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn ByteStore>,
    namespace: String,
    instruct: bool,
    dimensions: Option<usize>,
    cache_queries: bool,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl CachedEmbeddings {
    pub fn new(
        underlying: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn ByteStore>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            underlying,
            store,
            namespace: namespace.into(),
            instruct: false,
            dimensions: None,
            cache_queries: false,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Include the instruction flag in cache keys.
    pub fn with_instruct(mut self, instruct: bool) -> Self {
        self.instruct = instruct;
        self
    }

    /// Include the requested output dimension in cache keys.
    pub fn with_dimensions(mut self, dimensions: Option<usize>) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Route `embed_query` through the cache as well.
    pub fn with_query_cache(mut self, cache_queries: bool) -> Self {
        self.cache_queries = cache_queries;
        self
    }

    /// The wrapped provider, for callers that must bypass the cache.
    pub fn underlying(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.underlying)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn key(&self, text: &str) -> CacheKey {
        CacheKey::compute(&self.namespace, self.instruct, text, self.dimensions)
    }

    fn encode(vector: &[f32]) -> Result<Vec<u8>, EmbeddingError> {
        bincode::encode_to_vec(vector, config::standard())
            .map_err(|e| EmbeddingError::Encode(e.to_string()))
    }

    fn decode(key: &CacheKey, bytes: &[u8]) -> Option<Vec<f32>> {
        match bincode::decode_from_slice::<Vec<f32>, _>(bytes, config::standard()) {
            Ok((vector, _)) => Some(vector),
            Err(e) => {
                debug!(target: "ragshard::cache", "Undecodable cache entry {key}: {e}");
                None
            }
        }
    }
}

impl EmbeddingProvider for CachedEmbeddings {
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let keys: Vec<CacheKey> = texts.iter().map(|t| self.key(t)).collect();
        let mut vectors: Vec<Option<Vec<f32>>> = self
            .store
            .mget(&keys)?
            .into_iter()
            .zip(&keys)
            .map(|(bytes, key)| bytes.and_then(|b| Self::decode(key, &b)))
            .collect();

        // Misses in first-seen order, one provider input per distinct key
        let mut miss_index: HashMap<&CacheKey, usize> = HashMap::new();
        let mut miss_texts: Vec<&str> = Vec::new();
        let mut miss_keys: Vec<&CacheKey> = Vec::new();
        let mut pending: Vec<(usize, usize)> = Vec::new();
        for (position, vector) in vectors.iter().enumerate() {
            if vector.is_some() {
                continue;
            }
            let key = &keys[position];
            let slot = *miss_index.entry(key).or_insert_with(|| {
                miss_texts.push(texts[position]);
                miss_keys.push(key);
                miss_texts.len() - 1
            });
            pending.push((position, slot));
        }

        self.hits
            .fetch_add(texts.len() - pending.len(), Ordering::Relaxed);
        self.misses.fetch_add(miss_texts.len(), Ordering::Relaxed);

        if !miss_texts.is_empty() {
            let computed = self.underlying.embed_documents(&miss_texts)?;
            if computed.len() != miss_texts.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: miss_texts.len(),
                    actual: computed.len(),
                });
            }

            for (key, vector) in miss_keys.iter().zip(&computed) {
                let bytes = Self::encode(vector)?;
                if let Err(e) = self.store.put(key, &bytes) {
                    warn!(target: "ragshard::cache", "Failed to cache embedding {key}: {e}");
                }
            }
            for (position, slot) in pending {
                vectors[position] = Some(computed[slot].clone());
            }
        }

        let expected = texts.len();
        let resolved: Vec<Vec<f32>> = vectors.into_iter().flatten().collect();
        if resolved.len() != expected {
            return Err(EmbeddingError::CountMismatch {
                expected,
                actual: resolved.len(),
            });
        }
        Ok(resolved)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if !self.cache_queries {
            return self.underlying.embed_query(text);
        }

        let key = self.key(text);
        if let Some(vector) = self
            .store
            .get(&key)?
            .and_then(|bytes| Self::decode(&key, &bytes))
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let vector = self.underlying.embed_query(text)?;
        if let Err(e) = self.store.put(&key, &Self::encode(&vector)?) {
            warn!(target: "ragshard::cache", "Failed to cache query embedding {key}: {e}");
        }
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        self.underlying.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LocalFileStore, StoreOptions};
    use crate::vector::MockEmbeddingProvider;
    use tempfile::TempDir;

    fn cached(temp_dir: &TempDir) -> (Arc<MockEmbeddingProvider>, CachedEmbeddings) {
        let provider = Arc::new(MockEmbeddingProvider::new(16));
        let store = Arc::new(LocalFileStore::open(temp_dir.path(), StoreOptions::default()).unwrap());
        let engine = CachedEmbeddings::new(provider.clone(), store, "mock-16");
        (provider, engine)
    }

    #[test]
    fn test_second_call_is_served_from_cache() {
        let temp_dir = TempDir::new().unwrap();
        let (provider, engine) = cached(&temp_dir);

        let first = engine.embed_documents(&["alpha", "beta"]).unwrap();
        let second = engine.embed_documents(&["alpha", "beta"]).unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
        assert_eq!(engine.stats(), CacheStats { hits: 2, misses: 2 });
    }

    #[test]
    fn test_order_preserved_with_mixed_hits() {
        let temp_dir = TempDir::new().unwrap();
        let (provider, engine) = cached(&temp_dir);
        engine.embed_documents(&["b"]).unwrap();

        let vectors = engine.embed_documents(&["a", "b", "c"]).unwrap();

        assert_eq!(vectors[0], provider.vector_for("a"));
        assert_eq!(vectors[1], provider.vector_for("b"));
        assert_eq!(vectors[2], provider.vector_for("c"));
        // Only "a" and "c" went to the provider on the second call
        assert_eq!(provider.embedded_texts(), 3);
    }

    #[test]
    fn test_repeated_inputs_computed_once() {
        let temp_dir = TempDir::new().unwrap();
        let (provider, engine) = cached(&temp_dir);

        let vectors = engine.embed_documents(&["dup", "dup", "other", "dup"]).unwrap();

        assert_eq!(vectors.len(), 4);
        assert_eq!(vectors[0], vectors[3]);
        assert_eq!(provider.embedded_texts(), 2);
    }

    #[test]
    fn test_cache_survives_new_engine() {
        let temp_dir = TempDir::new().unwrap();
        let (_, engine) = cached(&temp_dir);
        let first = engine.embed_documents(&["persisted"]).unwrap();
        drop(engine);

        let (provider, engine) = cached(&temp_dir);
        let second = engine.embed_documents(&["persisted"]).unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn test_queries_bypass_cache_by_default() {
        let temp_dir = TempDir::new().unwrap();
        let (provider, engine) = cached(&temp_dir);

        engine.embed_query("q").unwrap();
        engine.embed_query("q").unwrap();
        assert_eq!(provider.calls(), 2);

        let engine = engine.with_query_cache(true);
        engine.embed_query("q").unwrap();
        engine.embed_query("q").unwrap();
        assert_eq!(provider.calls(), 3);
    }

    #[test]
    fn test_provider_count_mismatch_is_an_error() {
        struct Lossy;
        impl EmbeddingProvider for Lossy {
            fn embed_documents(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
                Ok(vec![vec![1.0]])
            }
            fn model_name(&self) -> &str {
                "lossy"
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(LocalFileStore::open(temp_dir.path(), StoreOptions::default()).unwrap());
        let engine = CachedEmbeddings::new(Arc::new(Lossy), store, "lossy");

        let err = engine.embed_documents(&["a", "b"]).unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::CountMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_underlying_bypasses_cache() {
        let temp_dir = TempDir::new().unwrap();
        let (provider, engine) = cached(&temp_dir);
        engine.embed_documents(&["x"]).unwrap();

        engine.underlying().embed_documents(&["x"]).unwrap();
        assert_eq!(provider.calls(), 2);
    }
}
