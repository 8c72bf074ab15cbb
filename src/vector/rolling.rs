//! Embedding of texts longer than the model context.
//!
//! Long texts are cut on whitespace into overlapping windows of at most
//! `max_tokens`, each window is embedded, and the window vectors are pooled
//! into one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tokens::TokenCounter;
use crate::vector::{EmbeddingError, EmbeddingProvider};

/// How window vectors collapse into one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    #[default]
    Mean,
    Max,
}

impl Pooling {
    fn pool(self, vectors: &[Vec<f32>]) -> Vec<f32> {
        let Some(first) = vectors.first() else {
            return Vec::new();
        };
        let mut pooled = first.clone();
        for vector in &vectors[1..] {
            for (acc, value) in pooled.iter_mut().zip(vector) {
                match self {
                    Pooling::Mean => *acc += value,
                    Pooling::Max => *acc = acc.max(*value),
                }
            }
        }
        if self == Pooling::Mean {
            let n = vectors.len() as f32;
            pooled.iter_mut().for_each(|v| *v /= n);
        }
        pooled
    }
}

/// Decorator that windows long documents before embedding.
pub struct RollingWindow<P> {
    inner: P,
    counter: Arc<dyn TokenCounter>,
    max_tokens: usize,
    pooling: Pooling,
}

impl<P: EmbeddingProvider> RollingWindow<P> {
    pub fn new(
        inner: P,
        counter: Arc<dyn TokenCounter>,
        max_tokens: usize,
        pooling: Pooling,
    ) -> Self {
        Self {
            inner,
            counter,
            max_tokens: max_tokens.max(1),
            pooling,
        }
    }

    /// Splits `text` into windows; short texts come back whole.
    pub fn windows(&self, text: &str) -> Vec<String> {
        if self.counter.count(text) <= self.max_tokens {
            return vec![text.to_string()];
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return vec![text.to_string()];
        }
        let mut windows = Vec::new();
        let mut start = 0;
        while start < words.len() {
            let mut end = start + 1;
            while end < words.len()
                && self.counter.count(&words[start..=end].join(" ")) <= self.max_tokens
            {
                end += 1;
            }
            windows.push(words[start..end].join(" "));
            if end >= words.len() {
                break;
            }
            // Consecutive windows overlap by two thirds
            start += ((end - start) / 3).max(1);
        }
        windows
    }
}

impl<P: EmbeddingProvider> EmbeddingProvider for RollingWindow<P> {
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut segments = Vec::new();
        let mut spans = Vec::with_capacity(texts.len());
        for text in texts {
            let windows = self.windows(text);
            spans.push(segments.len()..segments.len() + windows.len());
            segments.extend(windows);
        }

        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        let vectors = self.inner.embed_documents(&refs)?;
        if vectors.len() != segments.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: segments.len(),
                actual: vectors.len(),
            });
        }

        Ok(spans
            .into_iter()
            .map(|span| self.pooling.pool(&vectors[span]))
            .collect())
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let windows = self.windows(text);
        if windows.len() == 1 {
            return self.inner.embed_query(text);
        }
        let refs: Vec<&str> = windows.iter().map(String::as_str).collect();
        let vectors = self.inner.embed_documents(&refs)?;
        Ok(self.pooling.pool(&vectors))
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}
