//! Search wrapper that never returns ids missing from the docstore.
//!
//! An index whose vector buffer and docstore disagree (for example after an
//! interrupted merge) returns dangling ids from a raw search. The guard drops
//! those and widens the query until it has `k` live hits, the index is
//! exhausted, or the retry budget is spent.

use tracing::{debug, warn};

use crate::index::IndexShard;
use crate::types::{Document, DocumentId};
use crate::vector::{EmbeddingError, EmbeddingProvider};

/// One resolved search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: DocumentId,
    pub document: Document,
    pub distance: f32,
    pub score: f32,
}

#[derive(Debug)]
pub struct SearchGuard {
    index: IndexShard,
    max_retries: usize,
}

impl SearchGuard {
    pub const DEFAULT_MAX_RETRIES: usize = 10;

    pub fn new(index: IndexShard) -> Self {
        Self {
            index,
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn index(&self) -> &IndexShard {
        &self.index
    }

    pub fn into_inner(self) -> IndexShard {
        self.index
    }

    /// The `k` nearest documents that the docstore can resolve.
    ///
    /// Degrades to fewer hits instead of failing.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 {
            return Vec::new();
        }

        let relevance = self.index.relevance();
        let mut fetch = k;
        let mut retries = 0;
        loop {
            let raw = match self.index.search_raw(query, fetch) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(target: "ragshard::index", "Search failed: {e}");
                    return Vec::new();
                }
            };
            let exhausted = raw.len() < fetch;
            let fetched = raw.len();

            let (ids, distances): (Vec<DocumentId>, Vec<f32>) =
                raw.into_iter().map(|hit| (hit.id, hit.distance)).unzip();
            let scores: Vec<f32> = distances.iter().map(|d| relevance.score(*d)).collect();
            debug_assert_eq!(ids.len(), scores.len());

            let mut hits: Vec<SearchHit> = ids
                .into_iter()
                .zip(distances)
                .zip(scores)
                .filter_map(|((id, distance), score)| {
                    let document = self.index.document(&id)?.clone();
                    Some(SearchHit {
                        id,
                        document,
                        distance,
                        score,
                    })
                })
                .collect();

            if hits.len() >= k || exhausted || retries >= self.max_retries {
                if hits.len() < k {
                    debug!(
                        target: "ragshard::index",
                        "Returning {} of {k} requested hits after {retries} re-queries",
                        hits.len()
                    );
                }
                hits.truncate(k);
                return hits;
            }

            // Every dangling id seen so far sits ahead of the hits still missing
            let dangling = fetched - hits.len();
            fetch = k + dangling;
            retries += 1;
            debug!(
                target: "ragshard::index",
                "{dangling} dangling id(s) in results, re-querying with k={fetch}"
            );
        }
    }

    /// Embeds `query` and searches for it.
    pub fn similarity_search(
        &self,
        provider: &dyn EmbeddingProvider,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>, EmbeddingError> {
        let vector = provider.embed_query(query)?;
        Ok(self.search(&vector, k))
    }
}
