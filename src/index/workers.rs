//! Pool workers that move single-document shards between disk and memory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::cache::touch_accessed;
use crate::index::{IndexError, IndexShard, RelevanceScore, Worker};
use crate::types::{Document, DocumentId};
use crate::vector::VectorDimension;

/// Request to load one persisted shard.
#[derive(Debug, Clone)]
pub struct LoadJob {
    pub id: DocumentId,
    pub path: PathBuf,
    /// Metadata of the freshly loaded document, replacing the stored one
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Accumulates loaded shards into one running shard.
///
/// Unusable shards are removed from disk so they get rebuilt next time.
#[derive(Debug, Default)]
pub struct ShardLoader {
    shard: Option<IndexShard>,
    loaded: usize,
    skipped: usize,
    removed: usize,
}

impl ShardLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn discard(&mut self, path: &Path, reason: &str) {
        warn!(
            target: "ragshard::pool",
            "Removing unusable shard {}: {reason}",
            path.display()
        );
        if let Err(e) = fs::remove_dir_all(path) {
            error!(target: "ragshard::pool", "Failed to remove {}: {e}", path.display());
        }
        self.removed += 1;
    }

    fn load(&mut self, job: LoadJob) -> Result<(), String> {
        let mut shard = IndexShard::load(&job.path).map_err(|e| e.to_string())?;
        if shard.len() != 1 || shard.docstore_len() != 1 {
            return Err(format!(
                "expected a single-document shard, found {} vectors and {} documents",
                shard.len(),
                shard.docstore_len()
            ));
        }
        let stored_id = shard.ids()[0].clone();
        if stored_id != job.id {
            return Err(format!("shard holds '{stored_id}' instead of '{}'", job.id));
        }

        if self.shard.as_ref().is_some_and(|running| running.contains(&job.id)) {
            debug!(target: "ragshard::pool", "Skipping already loaded document {}", job.id);
            self.skipped += 1;
            return Ok(());
        }

        shard.set_metadata(&job.id, job.metadata);
        match self.shard.as_mut() {
            Some(running) => running.merge_from(shard).map_err(|e| e.to_string())?,
            None => self.shard = Some(shard),
        }

        touch_shard(&job.path);
        self.loaded += 1;
        Ok(())
    }
}

impl Worker for ShardLoader {
    type Input = LoadJob;
    type Output = IndexShard;
    const SENDS_PARTIAL: bool = true;

    fn handle(&mut self, job: LoadJob) {
        let path = job.path.clone();
        if let Err(reason) = self.load(job) {
            self.discard(&path, &reason);
        }
    }

    fn finish(self) -> Option<IndexShard> {
        debug!(
            target: "ragshard::pool",
            "Loader done: {} loaded, {} skipped, {} removed",
            self.loaded,
            self.skipped,
            self.removed
        );
        self.shard
    }
}

/// Request to persist one embedded document as its own shard.
#[derive(Debug, Clone)]
pub struct SaveJob {
    pub id: DocumentId,
    pub document: Document,
    pub vector: Vec<f32>,
    pub path: PathBuf,
}

/// Writes single-document shards.
#[derive(Debug)]
pub struct ShardSaver {
    relevance: RelevanceScore,
    saved: usize,
    failed: usize,
}

impl ShardSaver {
    pub fn new(relevance: RelevanceScore) -> Self {
        Self {
            relevance,
            saved: 0,
            failed: 0,
        }
    }

    fn save(&self, job: SaveJob) -> Result<(), IndexError> {
        let dimension = VectorDimension::new(job.vector.len())?;
        let shard = IndexShard::from_embeddings(
            dimension,
            [(job.id, job.document, job.vector)],
            self.relevance,
            true,
        )?;
        shard.save(&job.path)
    }
}

impl Worker for ShardSaver {
    type Input = SaveJob;
    type Output = ();

    fn handle(&mut self, job: SaveJob) {
        let path = job.path.clone();
        match self.save(job) {
            Ok(()) => self.saved += 1,
            Err(e) => {
                error!(target: "ragshard::pool", "Failed to save shard {}: {e}", path.display());
                self.failed += 1;
            }
        }
    }

    fn finish(self) -> Option<()> {
        if self.saved + self.failed > 0 {
            info!(
                target: "ragshard::pool",
                "Saver done: {} saved, {} failed",
                self.saved,
                self.failed
            );
        }
        None
    }
}

/// Marks a shard directory and its files as recently used.
fn touch_shard(path: &Path) {
    let targets = [
        path.to_path_buf(),
        path.join(crate::index::VECTORS_FILE),
        path.join(crate::index::DOCSTORE_FILE),
    ];
    for target in targets {
        if let Err(e) = touch_accessed(&target) {
            debug!(target: "ragshard::pool", "Failed to refresh access time of {}: {e}", target.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{PoolConfig, WorkerPool, shard_path};
    use crate::types::content_hash;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pool_config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            capacity: 4,
            poll_timeout: Duration::from_millis(50),
            join_timeout: Duration::from_secs(10),
        }
    }

    fn save_job(dir: &Path, text: &str, vector: Vec<f32>) -> SaveJob {
        let hash = content_hash(text);
        SaveJob {
            id: DocumentId::new(hash.clone()),
            document: Document::new(text).with_metadata("content_hash", hash.clone()),
            vector,
            path: shard_path(dir, &hash),
        }
    }

    fn load_job(dir: &Path, text: &str) -> LoadJob {
        let hash = content_hash(text);
        let mut metadata = BTreeMap::new();
        metadata.insert("content_hash".to_string(), serde_json::json!(hash.clone()));
        metadata.insert("source".to_string(), serde_json::json!("reloaded"));
        LoadJob {
            id: DocumentId::new(hash.clone()),
            path: shard_path(dir, &hash),
            metadata,
        }
    }

    #[test]
    fn test_save_then_load_through_pools() {
        let temp_dir = TempDir::new().unwrap();
        let texts = ["alpha", "beta", "gamma", "delta"];

        let savers = WorkerPool::spawn("saver", pool_config(2), |_| {
            ShardSaver::new(RelevanceScore::Linear)
        })
        .unwrap();
        for (i, text) in texts.iter().enumerate() {
            savers
                .dispatch(save_job(temp_dir.path(), text, vec![i as f32 + 1.0, 1.0]))
                .unwrap();
        }
        let saved = savers.shutdown();
        assert!(saved.partials.is_empty());
        assert_eq!(saved.unexpected_replies, 0);

        let loaders = WorkerPool::spawn("loader", pool_config(3), |_| ShardLoader::new()).unwrap();
        for text in texts {
            loaders.dispatch(load_job(temp_dir.path(), text)).unwrap();
        }
        let loaded = loaders.shutdown();

        let total: usize = loaded.partials.iter().map(IndexShard::len).sum();
        assert_eq!(total, 4);
        for shard in &loaded.partials {
            for (_, doc) in shard.documents() {
                assert_eq!(doc.metadata["source"], serde_json::json!("reloaded"));
            }
        }
    }

    #[test]
    fn test_duplicate_load_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        ShardSaver::new(RelevanceScore::Linear)
            .save(save_job(temp_dir.path(), "alpha", vec![1.0, 0.0]))
            .unwrap();

        let mut loader = ShardLoader::new();
        loader.handle(load_job(temp_dir.path(), "alpha"));
        loader.handle(load_job(temp_dir.path(), "alpha"));

        assert_eq!(loader.skipped, 1);
        assert!(shard_path(temp_dir.path(), &content_hash("alpha")).exists());
        assert_eq!(loader.finish().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_shard_is_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let job = load_job(temp_dir.path(), "broken");
        fs::create_dir_all(&job.path).unwrap();
        fs::write(job.path.join(crate::index::DOCSTORE_FILE), b"{not json").unwrap();

        let mut loader = ShardLoader::new();
        loader.handle(job.clone());

        assert!(!job.path.exists());
        assert_eq!(loader.removed, 1);
        assert!(loader.finish().is_none());
    }

    #[test]
    fn test_multi_document_shard_is_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let job = load_job(temp_dir.path(), "pair");
        let shard = IndexShard::from_embeddings(
            VectorDimension::new(2).unwrap(),
            vec![
                (job.id.clone(), Document::new("pair"), vec![1.0, 0.0]),
                (DocumentId::from("other"), Document::new("other"), vec![0.0, 1.0]),
            ],
            RelevanceScore::Linear,
            true,
        )
        .unwrap();
        shard.save(&job.path).unwrap();

        let mut loader = ShardLoader::new();
        loader.handle(job.clone());

        assert!(!job.path.exists());
        assert!(loader.finish().is_none());
    }
}
