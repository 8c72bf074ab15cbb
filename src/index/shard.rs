//! Exact flat L2 similarity index with an attached docstore.
//!
//! Vectors live in one contiguous row-major buffer; row `i` belongs to
//! `index_to_docstore_id[i]`, whose document is looked up in `docstore`.
//! The raw search deliberately does not check that the docstore still knows
//! an id; [`SearchGuard`](crate::index::SearchGuard) filters those out.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::index::IndexError;
use crate::types::{Document, DocumentId};
use crate::vector::{VectorDimension, l2_distance, normalize_l2};

/// Maps an L2 distance to a relevance score in `[0, 1]`.
///
/// Every variant scores distance 0 as 1 and never increases with distance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelevanceScore {
    /// `1 - d/2`, the natural scale for unit vectors
    #[default]
    Linear,
    /// `(1 - d/2)^2`
    Quadratic,
    /// `exp(-d)`
    Exponential,
}

impl RelevanceScore {
    pub const ALL: [RelevanceScore; 3] = [
        RelevanceScore::Linear,
        RelevanceScore::Quadratic,
        RelevanceScore::Exponential,
    ];

    pub fn score(self, distance: f32) -> f32 {
        let d = distance.max(0.0);
        match self {
            RelevanceScore::Linear => (1.0 - d / 2.0).clamp(0.0, 1.0),
            RelevanceScore::Quadratic => (1.0 - d / 2.0).clamp(0.0, 1.0).powi(2),
            RelevanceScore::Exponential => (-d).exp(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelevanceScore::Linear => "linear",
            RelevanceScore::Quadratic => "quadratic",
            RelevanceScore::Exponential => "exponential",
        }
    }
}

impl fmt::Display for RelevanceScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelevanceScore {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "quadratic" => Ok(Self::Quadratic),
            "exponential" => Ok(Self::Exponential),
            other => Err(IndexError::InvalidRelevance(other.to_string())),
        }
    }
}

/// A nearest-neighbour candidate straight from the vector buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub position: usize,
    pub id: DocumentId,
    pub distance: f32,
}

/// Flat exact index over a set of documents.
#[derive(Debug, Clone)]
pub struct IndexShard {
    dimension: VectorDimension,
    vectors: Vec<f32>,
    index_to_docstore_id: Vec<DocumentId>,
    // Mirrors index_to_docstore_id for constant-time collision checks
    indexed: HashSet<DocumentId>,
    docstore: HashMap<DocumentId, Document>,
    relevance: RelevanceScore,
    normalize: bool,
}

impl IndexShard {
    pub fn new(dimension: VectorDimension, relevance: RelevanceScore, normalize: bool) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            index_to_docstore_id: Vec::new(),
            indexed: HashSet::new(),
            docstore: HashMap::new(),
            relevance,
            normalize,
        }
    }

    /// Builds a shard from `(id, document, vector)` triples.
    pub fn from_embeddings(
        dimension: VectorDimension,
        items: impl IntoIterator<Item = (DocumentId, Document, Vec<f32>)>,
        relevance: RelevanceScore,
        normalize: bool,
    ) -> Result<Self, IndexError> {
        let mut shard = Self::new(dimension, relevance, normalize);
        for (id, document, vector) in items {
            shard.add_embedding(id, document, vector)?;
        }
        Ok(shard)
    }

    /// Rebuilds a shard from persisted parts, validating their shape.
    pub(crate) fn from_parts(
        dimension: VectorDimension,
        vectors: Vec<f32>,
        index_to_docstore_id: Vec<DocumentId>,
        docstore: HashMap<DocumentId, Document>,
        relevance: RelevanceScore,
        normalize: bool,
    ) -> Result<Self, IndexError> {
        if vectors.len() != index_to_docstore_id.len() * dimension.get() {
            return Err(IndexError::Corrupt(format!(
                "{} floats for {} ids of dimension {dimension}",
                vectors.len(),
                index_to_docstore_id.len()
            )));
        }
        let indexed: HashSet<DocumentId> = index_to_docstore_id.iter().cloned().collect();
        if indexed.len() != index_to_docstore_id.len() {
            return Err(IndexError::Corrupt(
                "repeated ids in index_to_docstore_id".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            vectors,
            index_to_docstore_id,
            indexed,
            docstore,
            relevance,
            normalize,
        })
    }

    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    pub fn relevance(&self) -> RelevanceScore {
        self.relevance
    }

    pub fn normalizes(&self) -> bool {
        self.normalize
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.index_to_docstore_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_to_docstore_id.is_empty()
    }

    /// Number of documents in the docstore.
    pub fn docstore_len(&self) -> usize {
        self.docstore.len()
    }

    /// Ids in vector order.
    pub fn ids(&self) -> &[DocumentId] {
        &self.index_to_docstore_id
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.docstore.contains_key(id)
    }

    pub fn document(&self, id: &DocumentId) -> Option<&Document> {
        self.docstore.get(id)
    }

    pub fn documents(&self) -> impl Iterator<Item = (&DocumentId, &Document)> {
        self.docstore.iter()
    }

    /// Raw vector stored at `position`.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let dim = self.dimension.get();
        self.vectors.get(position * dim..(position + 1) * dim)
    }

    pub(crate) fn raw_vectors(&self) -> &[f32] {
        &self.vectors
    }

    /// Replaces the metadata of a stored document.
    pub fn set_metadata(
        &mut self,
        id: &DocumentId,
        metadata: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> bool {
        match self.docstore.get_mut(id) {
            Some(document) => {
                document.metadata = metadata;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn docstore_mut(&mut self) -> &mut HashMap<DocumentId, Document> {
        &mut self.docstore
    }

    /// Appends one vector and its document.
    ///
    /// Fails with [`IndexError::DuplicateIds`] when the id is already
    /// present, leaving the shard untouched.
    pub fn add_embedding(
        &mut self,
        id: DocumentId,
        document: Document,
        mut vector: Vec<f32>,
    ) -> Result<(), IndexError> {
        self.dimension.validate_vector(&vector)?;
        if self.docstore.contains_key(&id) || self.indexed.contains(&id) {
            return Err(IndexError::DuplicateIds { ids: vec![id] });
        }
        if self.normalize {
            normalize_l2(&mut vector);
        }
        self.vectors.extend_from_slice(&vector);
        self.index_to_docstore_id.push(id.clone());
        self.indexed.insert(id.clone());
        self.docstore.insert(id, document);
        Ok(())
    }

    /// Bulk merge of another shard into this one.
    ///
    /// Validates dimensions and id collisions before mutating anything.
    pub fn merge_from(&mut self, other: IndexShard) -> Result<(), IndexError> {
        self.check_merge(&other)?;
        self.absorb(other);
        Ok(())
    }

    /// Validation half of [`IndexShard::merge_from`].
    pub(crate) fn check_merge(&self, other: &IndexShard) -> Result<(), IndexError> {
        if other.dimension != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension.get(),
                actual: other.dimension.get(),
            });
        }

        let mut seen = HashSet::new();
        let collisions: Vec<DocumentId> = other
            .index_to_docstore_id
            .iter()
            .chain(other.docstore.keys())
            .filter(|id| self.indexed.contains(*id) || self.docstore.contains_key(*id))
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect();
        if !collisions.is_empty() {
            return Err(IndexError::DuplicateIds { ids: collisions });
        }
        Ok(())
    }

    pub(crate) fn absorb(&mut self, other: IndexShard) {
        self.vectors.extend_from_slice(&other.vectors);
        self.indexed.extend(other.indexed);
        self.index_to_docstore_id.extend(other.index_to_docstore_id);
        self.docstore.extend(other.docstore);
    }

    /// The `k` nearest stored vectors to `query` by Euclidean distance.
    ///
    /// Ids are returned whether or not the docstore still holds them.
    pub fn search_raw(&self, query: &[f32], k: usize) -> Result<Vec<RawHit>, IndexError> {
        self.dimension.validate_vector(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        if self.normalize {
            normalize_l2(&mut query);
        }

        let dim = self.dimension.get();
        let mut hits: Vec<RawHit> = self
            .vectors
            .chunks_exact(dim)
            .zip(&self.index_to_docstore_id)
            .enumerate()
            .map(|(position, (row, id))| RawHit {
                position,
                id: id.clone(),
                distance: l2_distance(&query, row),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        });
        hits.truncate(k);
        Ok(hits)
    }
}
