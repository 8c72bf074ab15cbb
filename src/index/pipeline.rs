//! End-to-end index construction.
//!
//! [`IndexPipeline::build`] turns a document list into a searchable index:
//! shards persisted by earlier runs are warm-loaded through the loader pool,
//! the rest is embedded in parallel batches and persisted by the saver pool,
//! and everything is merged into one [`IndexShard`] behind a [`SearchGuard`].

use std::collections::HashSet;
use std::fs;
use std::iter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::cache::{ExpiryReport, LocalFileStore, StoreOptions, expire_dir, namespace_for};
use crate::config::Settings;
use crate::display::progress::create_progress_bar;
use crate::index::{
    Confirmation, CostEstimate, IndexError, IndexShard, LoadJob, SaveJob, SearchGuard,
    ShardBuildOutcome, ShardBuilder, ShardLoader, ShardSaver, StdinConfirmation, WorkerPool,
    estimate_cost, merge_all, price_per_token, shard_path,
};
use crate::tokens::{HeuristicTokenCounter, TokenCounter};
use crate::types::{Document, DocumentId};
use crate::vector::{CacheStats, CachedEmbeddings, check_embeddings, create_provider};

/// What a build did.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub total_documents: usize,
    pub unique_documents: usize,
    /// Documents restored from persisted shards
    pub loaded: usize,
    /// Documents embedded in this run
    pub embedded: usize,
    pub batches: usize,
    /// Batches embedded without the cache after repeated failures
    pub bypassed_batches: usize,
    pub failed_attempts: usize,
    /// Ids the merge could not insert
    pub failed_ids: Vec<DocumentId>,
    pub cost: Option<CostEstimate>,
    pub expiry: Option<ExpiryReport>,
    /// Pool threads that did not stop in time
    pub stuck_workers: usize,
    pub cache: CacheStats,
    /// The index came from `load_embeds_from`
    pub from_saved_index: bool,
    pub duration: Duration,
}

/// Builds indexes for one embedding model.
pub struct IndexPipeline {
    embeddings: Arc<CachedEmbeddings>,
    settings: Settings,
    shard_dir: PathBuf,
    embedding_cache_dir: Option<PathBuf>,
    confirmation: Box<dyn Confirmation>,
    tokens: Arc<dyn TokenCounter>,
    show_progress: bool,
}

impl IndexPipeline {
    pub fn new(embeddings: Arc<CachedEmbeddings>, settings: Settings, shard_dir: impl Into<PathBuf>) -> Self {
        Self {
            embeddings,
            settings,
            shard_dir: shard_dir.into(),
            embedding_cache_dir: None,
            confirmation: Box::new(StdinConfirmation),
            tokens: Arc::new(HeuristicTokenCounter),
            show_progress: true,
        }
    }

    /// Wires the configured provider, byte cache and shard directory.
    pub fn from_settings(settings: &Settings) -> Result<Self, IndexError> {
        let config = &settings.embedding;
        let namespace = namespace_for(&config.model, config.instruct, config.private);
        let provider = create_provider(config, &settings.models_dir(), true)?;
        check_embeddings(provider.as_ref())?;

        let cache_dir = settings.embeddings_dir(&namespace);
        let store = LocalFileStore::open(
            &cache_dir,
            StoreOptions {
                compress: settings.cache.compress,
                update_atime: true,
            },
        )?;
        let embeddings = CachedEmbeddings::new(provider, Arc::new(store), namespace.clone())
            .with_instruct(config.instruct)
            .with_dimensions(config.dimensions)
            .with_query_cache(config.cache_queries);

        Ok(Self::new(Arc::new(embeddings), settings.clone(), settings.shards_dir(&namespace))
            .with_embedding_cache_dir(cache_dir))
    }

    pub fn with_confirmation(mut self, confirmation: Box<dyn Confirmation>) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn with_token_counter(mut self, tokens: Arc<dyn TokenCounter>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Byte cache directory to include in expiry passes.
    pub fn with_embedding_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.embedding_cache_dir = Some(dir.into());
        self
    }

    pub fn embeddings(&self) -> &Arc<CachedEmbeddings> {
        &self.embeddings
    }

    pub fn shard_dir(&self) -> &PathBuf {
        &self.shard_dir
    }

    /// Builds a guarded index over `docs`.
    pub fn build(&self, docs: Vec<Document>) -> Result<(SearchGuard, BuildReport), IndexError> {
        let started = Instant::now();
        let mut report = BuildReport {
            total_documents: docs.len(),
            ..BuildReport::default()
        };

        if let Some(path) = &self.settings.index.load_embeds_from {
            info!(target: "ragshard::index", "Loading saved index from {}", path.display());
            let index = IndexShard::load(path)?;
            report.from_saved_index = true;
            report.loaded = index.docstore_len();
            report.unique_documents = index.docstore_len();
            report.duration = started.elapsed();
            return Ok((self.guard(index), report));
        }

        let mut unique = dedup(docs)?;
        report.unique_documents = unique.len();
        if unique.len() >= self.settings.index.shuffle_threshold {
            unique.shuffle(&mut rand::rng());
        }

        fs::create_dir_all(&self.shard_dir).map_err(|e| IndexError::io(&self.shard_dir, e))?;
        let (persisted, mut remaining): (Vec<_>, Vec<_>) = unique
            .into_iter()
            .partition(|(id, _)| shard_path(&self.shard_dir, id.as_str()).is_dir());

        let mut parts = Vec::new();
        if !persisted.is_empty() {
            let (loaded, stuck) = self.warm_load(&persisted)?;
            report.stuck_workers += stuck;

            let present: HashSet<&DocumentId> = loaded.iter().flat_map(|s| s.ids()).collect();
            report.loaded = present.len();
            let missing: Vec<(DocumentId, Document)> = persisted
                .into_iter()
                .filter(|(id, _)| !present.contains(id))
                .collect();
            if !missing.is_empty() {
                info!(
                    target: "ragshard::index",
                    "{} persisted shard(s) could not be loaded and will be rebuilt",
                    missing.len()
                );
            }
            remaining.extend(missing);
            parts.extend(loaded);
        }
        info!(
            target: "ragshard::index",
            "{} document(s) loaded from shards, {} to embed",
            report.loaded,
            remaining.len()
        );

        report.expiry = self.expire();

        let remaining: Vec<Document> = remaining.into_iter().map(|(_, doc)| doc).collect();
        if !remaining.is_empty() {
            let estimate = self.check_cost(&remaining)?;
            report.cost = Some(estimate);

            let stuck = self.embed(&remaining, &mut parts, &mut report)?;
            report.stuck_workers += stuck;
        }

        let Some(dimension) = parts.first().map(IndexShard::dimension) else {
            return Err(IndexError::NoDocuments);
        };
        let relevance = self.settings.index.relevance;
        let outcome = merge_all(iter::once(IndexShard::new(dimension, relevance, true)).chain(parts))?;
        report.failed_ids = outcome.failed;
        let index = outcome.index;

        if let Some(path) = &self.settings.index.save_embeds_as {
            index.save(path)?;
            info!(target: "ragshard::index", "Saved merged index to {}", path.display());
        }

        report.cache = self.embeddings.stats();
        report.duration = started.elapsed();
        info!(
            target: "ragshard::index",
            "Index ready: {} documents in {:.2?}",
            index.docstore_len(),
            report.duration
        );
        Ok((self.guard(index), report))
    }

    fn guard(&self, index: IndexShard) -> SearchGuard {
        SearchGuard::new(index).with_max_retries(self.settings.index.search_retries)
    }

    /// Loads persisted shards through the loader pool.
    fn warm_load(&self, persisted: &[(DocumentId, Document)]) -> Result<(Vec<IndexShard>, usize), IndexError> {
        let pools = &self.settings.pools;
        let loaders = WorkerPool::spawn(
            "ragshard-loader",
            pools.pool_config(pools.loader_workers),
            |_| ShardLoader::new(),
        )?;

        let progress = create_progress_bar(persisted.len() as u64, "Loading shards", self.show_progress);
        for (id, doc) in persisted {
            let job = LoadJob {
                id: id.clone(),
                path: shard_path(&self.shard_dir, id.as_str()),
                metadata: doc.metadata.clone(),
            };
            if let Err(e) = loaders.dispatch(job) {
                error!(target: "ragshard::pool", "Stopped queueing shard loads: {e}");
                break;
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        let shutdown = loaders.shutdown();
        debug!(
            target: "ragshard::pool",
            "Loader pool returned {} partial shard(s)",
            shutdown.partials.len()
        );
        Ok((shutdown.partials, shutdown.stuck_workers))
    }

    /// Expires unused cache entries and shards when configured.
    fn expire(&self) -> Option<ExpiryReport> {
        let days = self.settings.cache.expire_days?;
        let mut total = ExpiryReport::default();
        let dirs = iter::once(&self.shard_dir).chain(self.embedding_cache_dir.as_ref());
        for dir in dirs {
            match expire_dir(dir, days) {
                Ok(report) => total.absorb(report),
                Err(e) => warn!(target: "ragshard::cache", "Expiry of {} failed: {e}", dir.display()),
            }
        }
        info!(target: "ragshard::cache", "Expired entries older than {days} days: {}", total.display());
        Some(total)
    }

    /// Estimates the embedding cost of `docs` and asks when it is over the limit.
    fn check_cost(&self, docs: &[Document]) -> Result<CostEstimate, IndexError> {
        let embedding = &self.settings.embedding;
        let price = price_per_token(&embedding.model, embedding.private, self.settings.cost.price_per_token);
        let estimate = estimate_cost(docs, self.tokens.as_ref(), price);

        if estimate.dollars > self.settings.cost.dollar_limit {
            warn!(
                target: "ragshard::index",
                "{} exceeds the limit of ${}",
                estimate.display(),
                self.settings.cost.dollar_limit
            );
            if !self.confirmation.confirm(&estimate) {
                return Err(IndexError::CostDeclined {
                    dollars: estimate.dollars,
                });
            }
        } else if estimate.dollars > 0.0 {
            info!(target: "ragshard::index", "{}", estimate.display());
        }
        Ok(estimate)
    }

    /// Embeds `docs` in parallel batches, persisting every document as it goes.
    fn embed(
        &self,
        docs: &[Document],
        parts: &mut Vec<IndexShard>,
        report: &mut BuildReport,
    ) -> Result<usize, IndexError> {
        let index = &self.settings.index;
        let pools = &self.settings.pools;
        let relevance = index.relevance;

        let builder = ShardBuilder::new(Arc::clone(&self.embeddings), relevance)
            .with_retries(index.retry_attempts, index.retry_backoff());
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(index.effective_embed_threads())
            .thread_name(|i| format!("ragshard-embed-{i}"))
            .build()
            .map_err(|e| IndexError::ThreadPool(e.to_string()))?;
        let savers = WorkerPool::spawn(
            "ragshard-saver",
            pools.pool_config(pools.saver_workers),
            |_| ShardSaver::new(relevance),
        )?;

        let batches: Vec<&[Document]> = docs.chunks(index.batch_size.max(1)).collect();
        report.batches = batches.len();
        let progress = create_progress_bar(batches.len() as u64, "Embedding batches", self.show_progress);

        let results: Vec<Result<ShardBuildOutcome, IndexError>> = threads.install(|| {
            batches
                .par_iter()
                .map(|batch| {
                    let outcome = builder.build(batch)?;
                    self.persist(&savers, &outcome.shard);
                    progress.inc(1);
                    Ok(outcome)
                })
                .collect()
        });
        progress.finish_and_clear();

        let stuck = savers.shutdown().stuck_workers;

        for result in results {
            let outcome = result?;
            report.embedded += outcome.shard.len();
            report.failed_attempts += outcome.failed_attempts;
            if outcome.bypassed_cache {
                report.bypassed_batches += 1;
            }
            parts.push(outcome.shard);
        }
        Ok(stuck)
    }

    /// Queues one single-document save per document of `shard`.
    fn persist(&self, savers: &WorkerPool<SaveJob, ()>, shard: &IndexShard) {
        for (position, id) in shard.ids().iter().enumerate() {
            let (Some(document), Some(vector)) = (shard.document(id), shard.vector(position)) else {
                continue;
            };
            let job = SaveJob {
                id: id.clone(),
                document: document.clone(),
                vector: vector.to_vec(),
                path: shard_path(&self.shard_dir, id.as_str()),
            };
            if let Err(e) = savers.dispatch(job) {
                error!(target: "ragshard::pool", "Could not queue save of {id}: {e}");
            }
        }
    }
}

/// Keeps the first document of every content hash.
fn dedup(docs: Vec<Document>) -> Result<Vec<(DocumentId, Document)>, IndexError> {
    if docs.is_empty() {
        return Err(IndexError::NoDocuments);
    }

    let total = docs.len();
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(total);
    for (position, doc) in docs.into_iter().enumerate() {
        let id = doc
            .content_hash()
            .map(DocumentId::new)
            .ok_or(IndexError::MissingContentHash { position })?;
        if seen.insert(id.clone()) {
            unique.push((id, doc));
        }
    }
    if unique.len() < total {
        debug!(
            target: "ragshard::index",
            "Dropped {} duplicate document(s)",
            total - unique.len()
        );
    }
    Ok(unique)
}
