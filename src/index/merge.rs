//! Merging shards into one index without losing documents.

use tracing::{debug, warn};

use crate::index::{IndexError, IndexShard};
use crate::types::DocumentId;

/// Result of folding many shards into one.
#[derive(Debug)]
pub struct MergeOutcome {
    pub index: IndexShard,
    /// Ids that could not be inserted, usually because they were present already
    pub failed: Vec<DocumentId>,
    /// Sum of docstore sizes over every input shard
    pub expected_total: usize,
}

/// Merges `other` into `primary`, returning the ids that could not be added.
///
/// The bulk path is tried first. When ids collide, every vector of `other`
/// is inserted on its own and the colliding ones are reported as failed.
/// Ids whose document or vector is missing from `other` are failed too.
pub fn merge_into(primary: &mut IndexShard, other: IndexShard) -> Result<Vec<DocumentId>, IndexError> {
    match primary.check_merge(&other) {
        Ok(()) => {
            primary.absorb(other);
            return Ok(Vec::new());
        }
        Err(IndexError::DuplicateIds { ids }) => {
            debug!(
                target: "ragshard::index",
                "Bulk merge hit {} duplicate id(s), merging one by one",
                ids.len()
            );
        }
        Err(e) => return Err(e),
    }

    let mut failed = Vec::new();
    for (position, id) in other.ids().iter().enumerate() {
        let (Some(document), Some(vector)) = (other.document(id), other.vector(position)) else {
            failed.push(id.clone());
            continue;
        };
        match primary.add_embedding(id.clone(), document.clone(), vector.to_vec()) {
            Ok(()) => {}
            Err(IndexError::DuplicateIds { .. }) => failed.push(id.clone()),
            Err(e) => return Err(e),
        }
    }

    // Documents without a vector cannot be searched; report them
    let indexed: std::collections::HashSet<&DocumentId> = other.ids().iter().collect();
    failed.extend(
        other
            .documents()
            .filter(|(id, _)| !indexed.contains(id))
            .map(|(id, _)| id.clone()),
    );

    Ok(failed)
}

/// Folds `shards` left to right into the first one.
pub fn merge_all(shards: impl IntoIterator<Item = IndexShard>) -> Result<MergeOutcome, IndexError> {
    let mut shards = shards.into_iter();
    let mut index = shards.next().ok_or(IndexError::NoDocuments)?;
    let mut expected_total = index.docstore_len();
    let mut failed = Vec::new();

    for shard in shards {
        expected_total += shard.docstore_len();
        failed.extend(merge_into(&mut index, shard)?);
    }

    if index.docstore_len() != expected_total.saturating_sub(failed.len()) {
        warn!(
            target: "ragshard::index",
            "Merged index holds {} documents, expected {} ({} inputs, {} failed)",
            index.docstore_len(),
            expected_total.saturating_sub(failed.len()),
            expected_total,
            failed.len()
        );
    }
    if !failed.is_empty() {
        debug!(target: "ragshard::index", "{} id(s) were not merged", failed.len());
    }

    Ok(MergeOutcome {
        index,
        failed,
        expected_total,
    })
}
