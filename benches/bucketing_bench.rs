//! Benchmarks for semantic bucketing and its clustering steps

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ragshard::config::BucketingConfig;
use ragshard::semantic::Dendrogram;
use ragshard::semantic::linalg::{euclidean_distances, pca, standard_scale};
use ragshard::vector::{EmbeddingProvider, MockEmbeddingProvider};
use ragshard::SemanticBucketer;
use std::hint::black_box;
use std::sync::Arc;

fn answers(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("Intermediate answer {i} about topic {}", i % 7))
        .collect()
}

fn embedded(n: usize, dimension: usize) -> Vec<Vec<f64>> {
    let provider = MockEmbeddingProvider::new(dimension);
    answers(n)
        .iter()
        .map(|t| {
            provider
                .embed_query(t)
                .expect("mock embedding")
                .into_iter()
                .map(f64::from)
                .collect()
        })
        .collect()
}

/// Full bucketing pipeline with a 384 dimensional mock model
fn bench_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("bucketing");

    for n in [20, 60] {
        let texts = answers(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("bucket", n), &texts, |b, texts| {
            let bucketer = SemanticBucketer::new(
                Arc::new(MockEmbeddingProvider::new(384)),
                BucketingConfig::default(),
            );
            b.iter(|| black_box(bucketer.bucket(black_box(texts)).expect("bucketing")));
        });
    }

    group.finish();
}

/// Ward linkage followed by optimal leaf ordering
fn bench_linkage(c: &mut Criterion) {
    let mut group = c.benchmark_group("linkage");

    for n in [30, 60, 120] {
        let distances = euclidean_distances(&embedded(n, 32));
        group.bench_with_input(BenchmarkId::new("ward_olo", n), &distances, |b, d| {
            b.iter(|| {
                let tree = Dendrogram::ward(black_box(d)).optimal_leaf_ordering(d);
                black_box(tree.maxclust(n / 3))
            });
        });
    }

    group.finish();
}

fn bench_projection(c: &mut Criterion) {
    let rows = embedded(60, 384);
    c.bench_function("pca_60x384", |b| {
        b.iter(|| {
            let mut scaled = rows.clone();
            standard_scale(&mut scaled);
            black_box(pca(&scaled, 30))
        });
    });
}

criterion_group!(benches, bench_bucket, bench_linkage, bench_projection);
criterion_main!(benches);
