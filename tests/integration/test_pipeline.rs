//! End-to-end index builds against a temporary cache directory.

use ragshard::cache::{ByteStore, LocalFileStore, StoreOptions};
use ragshard::index::{
    AlwaysConfirm, DOCSTORE_FILE, IndexError, NeverConfirm, VECTORS_FILE, shard_path,
};
use ragshard::vector::MockEmbeddingProvider;
use ragshard::{CachedEmbeddings, Document, IndexPipeline, Settings, content_hash};
use std::fs::{File, FileTimes};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn docs(texts: &[&str]) -> Vec<Document> {
    texts
        .iter()
        .map(|t| {
            let mut doc = Document::new(*t).with_metadata("source", "test");
            doc.ensure_content_hash();
            doc
        })
        .collect()
}

fn settings(cache_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.cache_dir = cache_dir.to_path_buf();
    settings.index.batch_size = 3;
    settings.index.embed_threads = 2;
    settings.index.retry_backoff_ms = 1;
    settings.pools.loader_workers = 2;
    settings.pools.saver_workers = 2;
    settings.pools.poll_timeout_secs = 1;
    settings.pools.join_timeout_secs = 10;
    settings
}

fn pipeline(cache_dir: &Path, provider: Arc<MockEmbeddingProvider>, settings: Settings) -> IndexPipeline {
    let store: Arc<dyn ByteStore> = Arc::new(
        LocalFileStore::open(cache_dir.join("embeddings"), StoreOptions::default()).unwrap(),
    );
    let cached = Arc::new(CachedEmbeddings::new(provider, store, "mock"));
    IndexPipeline::new(cached, settings, cache_dir.join("shards"))
        .with_confirmation(Box::new(AlwaysConfirm))
        .with_progress(false)
}

const TEXTS: [&str; 7] = [
    "Shards are merged into one index",
    "Embeddings are cached by content",
    "Workers load shards concurrently",
    "Dangling ids trigger a wider search",
    "Buckets group related answers",
    "The cost is checked before embedding",
    "Old cache entries expire",
];

#[test]
fn test_expensive_build_is_declined_before_embedding() {
    let temp_dir = TempDir::new().unwrap();
    let provider = Arc::new(MockEmbeddingProvider::new(16));

    // Two four-byte documents are two tokens: $100 against a $10 limit
    let mut settings = settings(temp_dir.path());
    settings.cost.price_per_token = Some(50.0);
    settings.cost.dollar_limit = 10.0;

    let err = pipeline(temp_dir.path(), provider.clone(), settings)
        .with_confirmation(Box::new(NeverConfirm))
        .build(docs(&["abcd", "efgh"]))
        .unwrap_err();

    match err {
        IndexError::CostDeclined { dollars } => assert!((dollars - 100.0).abs() < 1e-9),
        other => panic!("expected CostDeclined, got {other:?}"),
    }
    assert_eq!(provider.calls(), 0);
}

#[test]
fn test_accepted_cost_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let provider = Arc::new(MockEmbeddingProvider::new(16));
    let mut settings = settings(temp_dir.path());
    settings.cost.price_per_token = Some(50.0);
    settings.cost.dollar_limit = 10.0;

    let (guard, report) = pipeline(temp_dir.path(), provider, settings)
        .build(docs(&["abcd", "efgh"]))
        .unwrap();

    let cost = report.cost.expect("cost is estimated on cold builds");
    assert_eq!(cost.tokens, 2);
    assert_eq!(guard.index().len(), 2);
}

#[test]
fn test_warm_start_reuses_shards() {
    let temp_dir = TempDir::new().unwrap();

    let first = Arc::new(MockEmbeddingProvider::new(16));
    let (_, cold) = pipeline(temp_dir.path(), first.clone(), settings(temp_dir.path()))
        .build(docs(&TEXTS))
        .unwrap();
    assert_eq!(cold.embedded, TEXTS.len());
    assert!(first.calls() > 0);

    let second = Arc::new(MockEmbeddingProvider::new(16));
    let (guard, warm) = pipeline(temp_dir.path(), second.clone(), settings(temp_dir.path()))
        .build(docs(&TEXTS))
        .unwrap();

    assert_eq!(second.calls(), 0);
    assert_eq!(warm.loaded, TEXTS.len());
    assert_eq!(warm.embedded, 0);
    assert_eq!(guard.index().len(), TEXTS.len());

    let hits = guard
        .similarity_search(second.as_ref(), TEXTS[3], 2)
        .unwrap();
    assert_eq!(hits[0].document.page_content, TEXTS[3]);
    assert_eq!(hits[0].document.metadata["source"], "test");
}

#[test]
fn test_new_documents_join_a_warm_index() {
    let temp_dir = TempDir::new().unwrap();
    let provider = Arc::new(MockEmbeddingProvider::new(16));

    pipeline(temp_dir.path(), provider.clone(), settings(temp_dir.path()))
        .build(docs(&TEXTS[..4]))
        .unwrap();

    let (guard, report) = pipeline(temp_dir.path(), provider, settings(temp_dir.path()))
        .build(docs(&TEXTS))
        .unwrap();

    assert_eq!(report.loaded, 4);
    assert_eq!(report.embedded, 3);
    assert_eq!(guard.index().len(), TEXTS.len());
}

#[test]
fn test_damaged_shard_is_rebuilt() {
    let temp_dir = TempDir::new().unwrap();
    let provider = Arc::new(MockEmbeddingProvider::new(16));
    let shards = temp_dir.path().join("shards");

    pipeline(temp_dir.path(), provider.clone(), settings(temp_dir.path()))
        .build(docs(&TEXTS))
        .unwrap();

    let damaged = shard_path(&shards, &content_hash(TEXTS[0]));
    std::fs::write(damaged.join(VECTORS_FILE), b"garbage").unwrap();

    let (guard, report) = pipeline(temp_dir.path(), provider, settings(temp_dir.path()))
        .build(docs(&TEXTS))
        .unwrap();

    assert_eq!(report.loaded, TEXTS.len() - 1);
    assert_eq!(report.embedded, 1);
    assert_eq!(guard.index().len(), TEXTS.len());
    assert!(ragshard::IndexShard::load(&damaged).is_ok());
}

fn age_shard(shard: &Path, days: u64) {
    let past = SystemTime::now() - Duration::from_secs(days * 24 * 3600);
    for path in [shard.join(VECTORS_FILE), shard.join(DOCSTORE_FILE), shard.to_path_buf()] {
        File::open(&path)
            .unwrap()
            .set_times(FileTimes::new().set_accessed(past))
            .unwrap();
    }
}

#[test]
fn test_stale_shard_expires_and_is_rebuilt() {
    let temp_dir = TempDir::new().unwrap();
    let provider = Arc::new(MockEmbeddingProvider::new(16));
    let shards = temp_dir.path().join("shards");

    pipeline(temp_dir.path(), provider.clone(), settings(temp_dir.path()))
        .build(docs(&TEXTS))
        .unwrap();

    let stale = shard_path(&shards, &content_hash(TEXTS[0]));
    age_shard(&stale, 30);

    let mut expiring = settings(temp_dir.path());
    expiring.cache.expire_days = Some(7);

    // The stale document is not requested, so nothing refreshes its shard
    let (_, report) = pipeline(temp_dir.path(), provider.clone(), expiring.clone())
        .build(docs(&TEXTS[1..]))
        .unwrap();

    let expiry = report.expiry.expect("expiry is configured");
    assert_eq!(expiry.scanned, TEXTS.len());
    assert_eq!(expiry.removed, 1);
    assert!(expiry.bytes_reclaimed > 0);
    assert!(!stale.exists());
    for text in &TEXTS[1..] {
        assert!(shard_path(&shards, &content_hash(text)).is_dir());
    }

    let (guard, rebuilt) = pipeline(temp_dir.path(), provider, expiring)
        .build(docs(&TEXTS))
        .unwrap();

    assert_eq!(rebuilt.loaded, TEXTS.len() - 1);
    assert_eq!(rebuilt.embedded, 1);
    assert_eq!(rebuilt.expiry.map(|e| e.removed), Some(0));
    assert_eq!(guard.index().len(), TEXTS.len());
    assert!(stale.is_dir());
}
