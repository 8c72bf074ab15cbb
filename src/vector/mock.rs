//! Deterministic in-process embedding provider.
//!
//! Produces unit vectors derived from a SHA-256 stream of the text, so equal
//! texts always map to bit-identical vectors and distinct texts land far
//! apart. Compiled for tests and with the `test-utils` feature.

use std::sync::atomic::{AtomicUsize, Ordering};

use sha2::{Digest, Sha256};

use crate::vector::{EmbeddingError, EmbeddingProvider, normalize_l2};

/// Hash-based provider that counts its calls.
#[derive(Debug)]
pub struct MockEmbeddingProvider {
    dimension: usize,
    name: String,
    calls: AtomicUsize,
    embedded: AtomicUsize,
    failures_left: AtomicUsize,
}

impl MockEmbeddingProvider {
    /// Create a mock producing `dimension`-sized vectors.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            name: format!("mock-{dimension}"),
            calls: AtomicUsize::new(0),
            embedded: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` calls with a provider error.
    #[must_use]
    pub fn with_failures(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Number of `embed_documents`/`embed_query` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of individual texts embedded so far.
    pub fn embedded_texts(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }

    /// Vector for `text`, without touching the counters.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut block = 0u64;
        while vector.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(block.to_le_bytes());
            hasher.update(text.as_bytes());
            for byte in hasher.finalize() {
                if vector.len() == self.dimension {
                    break;
                }
                vector.push(f32::from(byte) / 255.0 - 0.5);
            }
            block += 1;
        }
        normalize_l2(&mut vector);
        vector
    }

    fn record(&self, texts: usize) -> Result<(), EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EmbeddingError::Provider("injected failure".to_string()));
        }
        self.embedded.fetch_add(texts, Ordering::SeqCst);
        Ok(())
    }
}

impl EmbeddingProvider for MockEmbeddingProvider {
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.record(texts.len())?;
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.record(1)?;
        Ok(self.vector_for(text))
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_is_deterministic_and_normalized() {
        let provider = MockEmbeddingProvider::new(384);
        let a = provider.embed_documents(&["fn parse_json()"]).unwrap();
        let b = provider.embed_documents(&["fn parse_json()"]).unwrap();

        assert_eq!(a, b);
        assert_eq!(a[0].len(), 384);
        let magnitude: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01);
        assert_eq!(provider.calls(), 2);
        assert_eq!(provider.embedded_texts(), 2);
    }

    #[test]
    fn test_distinct_texts_differ() {
        let provider = MockEmbeddingProvider::new(32);
        let vectors = provider.embed_documents(&["alpha", "beta"]).unwrap();
        assert_ne!(vectors[0], vectors[1]);
    }

    #[test]
    fn test_injected_failures() {
        let provider = MockEmbeddingProvider::new(4).with_failures(2);
        assert!(provider.embed_documents(&["x"]).is_err());
        assert!(provider.embed_query("x").is_err());
        assert!(provider.embed_documents(&["x"]).is_ok());
        assert_eq!(provider.calls(), 3);
        assert_eq!(provider.embedded_texts(), 1);
    }
}
