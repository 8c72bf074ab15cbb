//! Bucketing through the embedding cache.

use ragshard::cache::{ByteStore, LocalFileStore, StoreOptions};
use ragshard::config::BucketingConfig;
use ragshard::vector::MockEmbeddingProvider;
use ragshard::{CachedEmbeddings, SemanticBucketer};
use std::sync::Arc;
use tempfile::TempDir;

fn answers(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("Answer {i}: the shard for document {} was merged", i * 7))
        .collect()
}

#[test]
fn test_bucketing_is_repeatable_through_the_cache() {
    let temp_dir = TempDir::new().unwrap();
    let mock = Arc::new(MockEmbeddingProvider::new(64));
    let store: Arc<dyn ByteStore> =
        Arc::new(LocalFileStore::open(temp_dir.path(), StoreOptions::default()).unwrap());
    let cached = Arc::new(CachedEmbeddings::new(mock.clone(), store, "mock").with_query_cache(true));
    let bucketer = SemanticBucketer::new(cached.clone(), BucketingConfig::default());

    let input = answers(30);
    let first = bucketer.bucket(&input).unwrap();
    let calls = mock.calls();
    let second = bucketer.bucket(&input).unwrap();

    assert_eq!(first, second);
    assert_eq!(mock.calls(), calls);
    assert!(cached.stats().hits >= input.len());

    let mut flat: Vec<String> = first.into_iter().flatten().collect();
    flat.sort();
    let mut expected = input.clone();
    expected.sort();
    assert_eq!(flat, expected);
}

#[test]
fn test_buckets_respect_the_token_budget() {
    let mut config = BucketingConfig::default();
    config.max_tokens = 200;
    let bucketer = SemanticBucketer::new(Arc::new(MockEmbeddingProvider::new(32)), config);

    // About 25 tokens per text
    let input: Vec<String> = (0..24)
        .map(|i| format!("{i:02} {}", "lorem ipsum ".repeat(8)))
        .collect();
    let buckets = bucketer.bucket(&input).unwrap();

    assert!(buckets.len() >= 2, "{buckets:?}");
    assert!(buckets.iter().all(|b| b.len() >= 2));
}
