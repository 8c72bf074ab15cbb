//! Groups texts into token-bounded buckets of semantically close neighbours.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::BucketingConfig;
use crate::semantic::linalg::{euclidean_distances, pca, standard_scale};
use crate::semantic::{BucketingError, Dendrogram};
use crate::tokens::{HeuristicTokenCounter, TokenCounter};
use crate::vector::EmbeddingProvider;

/// Cluster-count divisors tried in order until a cut yields several clusters.
const CLUSTER_DIVISORS: [usize; 4] = [2, 3, 4, 5];

pub struct SemanticBucketer {
    provider: Arc<dyn EmbeddingProvider>,
    tokens: Arc<dyn TokenCounter>,
    config: BucketingConfig,
}

impl SemanticBucketer {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: BucketingConfig) -> Self {
        Self {
            provider,
            tokens: Arc::new(HeuristicTokenCounter),
            config,
        }
    }

    pub fn with_token_counter(mut self, tokens: Arc<dyn TokenCounter>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Splits `texts` into buckets of related texts.
    ///
    /// Duplicates are dropped. Small inputs come back as a single bucket.
    /// Otherwise every bucket holds at least two texts, stays within the
    /// token budget unless it holds an oversize text, and lists its texts in
    /// dendrogram leaf order.
    pub fn bucket<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<Vec<String>>, BucketingError> {
        if texts.is_empty() {
            return Err(BucketingError::EmptyInput);
        }
        let mut seen = HashSet::new();
        let texts: Vec<String> = texts
            .iter()
            .map(|t| t.as_ref())
            .filter(|t| seen.insert(*t))
            .map(str::to_string)
            .collect();
        if texts.len() < self.config.min_texts.max(2) {
            return Ok(vec![texts]);
        }

        let n = texts.len();
        let rows = self.embed(&texts)?;
        let distances = euclidean_distances(&rows);
        let tree = Dendrogram::ward(&distances).optimal_leaf_ordering(&distances);

        let mut rank = vec![0; n];
        for (position, leaf) in tree.leaf_order().into_iter().enumerate() {
            rank[leaf] = position;
        }

        let mut labels = flat_clusters(&tree, n)?;
        absorb_singleton_clusters(&mut labels, &distances);
        if distinct(&labels).len() < 2 {
            return Err(BucketingError::SingleCluster);
        }

        let sizes: Vec<usize> = texts.iter().map(|t| self.tokens.count(t)).collect();
        let mut buckets = pack(&labels, &rank, &sizes, self.config.max_tokens);
        for bucket in &mut buckets {
            bucket.sort_by_key(|&i| rank[i]);
        }
        merge_singleton_buckets(&mut buckets, &rank, &distances);
        check_invariants(&buckets, n)?;

        debug!(
            target: "ragshard::semantic",
            "Bucketed {n} texts into {} buckets",
            buckets.len()
        );
        Ok(buckets
            .into_iter()
            .map(|bucket| bucket.into_iter().map(|i| texts[i].clone()).collect())
            .collect())
    }

    /// Embeds every text as a query, reducing with PCA when the dimension is large.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, BucketingError> {
        let mut rows = Vec::with_capacity(texts.len());
        for text in texts {
            let vector = self.provider.embed_query(text)?;
            rows.push(vector.into_iter().map(f64::from).collect::<Vec<f64>>());
        }

        let dimension = rows[0].len();
        if dimension <= 2 {
            return Err(BucketingError::DegenerateEmbeddings { dimension });
        }
        if let Some(row) = rows.iter().find(|r| r.len() != dimension) {
            return Err(crate::vector::EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: row.len(),
            }
            .into());
        }

        let components = self.config.max_dimensions.min(texts.len());
        if dimension <= components {
            return Ok(rows);
        }
        standard_scale(&mut rows);
        let projection = pca(&rows, components);
        if projection.explained_variance <= self.config.variance_target {
            warn!(
                target: "ragshard::semantic",
                "Found lower than expected PCA explained variance ratio: {:.4}",
                projection.explained_variance
            );
        }
        debug!(
            target: "ragshard::semantic",
            "Reduced embeddings from {dimension} to {components} dimensions"
        );
        Ok(projection.rows)
    }
}

fn distinct(labels: &[usize]) -> BTreeSet<usize> {
    labels.iter().copied().collect()
}

/// First maxclust cut, over decreasing cluster counts, with several clusters.
fn flat_clusters(tree: &Dendrogram, n: usize) -> Result<Vec<usize>, BucketingError> {
    for divisor in CLUSTER_DIVISORS {
        let labels = tree.maxclust(n / divisor);
        if distinct(&labels).len() > 1 {
            return Ok(labels);
        }
    }
    Err(BucketingError::SingleCluster)
}

/// Gives every single-text cluster a companion.
///
/// A lone text joins the cluster of its nearest neighbour, unless that would
/// leave a single cluster; then the neighbour moves over instead.
fn absorb_singleton_clusters(labels: &mut [usize], distances: &[Vec<f64>]) {
    // Labels are recomputed after every move, each text is handled at most once
    let mut handled = vec![false; labels.len()];
    while let Some(lone) = next_singleton(labels, &handled) {
        handled[lone] = true;
        let Some(nearest) = nearest_other(lone, distances) else {
            continue;
        };

        if distinct(labels).len() == 2 {
            labels[nearest] = labels[lone];
        } else {
            labels[lone] = labels[nearest];
        }
    }
}

/// First unhandled text that is alone in its cluster, in label order.
fn next_singleton(labels: &[usize], handled: &[bool]) -> Option<usize> {
    distinct(labels).into_iter().find_map(|label| {
        let mut members = (0..labels.len()).filter(|&i| labels[i] == label);
        match (members.next(), members.next()) {
            (Some(lone), None) if !handled[lone] => Some(lone),
            _ => None,
        }
    })
}

fn nearest_other(index: usize, distances: &[Vec<f64>]) -> Option<usize> {
    (0..distances.len())
        .filter(|&j| j != index)
        .min_by(|&a, &b| distances[index][a].total_cmp(&distances[index][b]))
}

/// Greedy packing of each cluster, in label order, under the token budget.
fn pack(labels: &[usize], rank: &[usize], sizes: &[usize], max_tokens: usize) -> Vec<Vec<usize>> {
    let mut buckets = Vec::new();
    for label in distinct(labels) {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == label).collect();
        members.sort_by_key(|&i| rank[i]);

        let mut current: Vec<usize> = Vec::new();
        let mut tokens = 0;
        for index in members {
            if !current.is_empty() && tokens + sizes[index] > max_tokens {
                buckets.push(std::mem::take(&mut current));
                tokens = 0;
            }
            current.push(index);
            tokens += sizes[index];
        }
        if !current.is_empty() {
            buckets.push(current);
        }
    }
    buckets
}

/// Folds single-text buckets into their closest neighbouring bucket.
fn merge_singleton_buckets(buckets: &mut Vec<Vec<usize>>, rank: &[usize], distances: &[Vec<f64>]) {
    while buckets.len() > 1 {
        let Some(position) = buckets.iter().position(|b| b.len() == 1) else {
            break;
        };
        let text = buckets[position][0];
        let min_distance = |bucket: &[usize]| {
            bucket
                .iter()
                .map(|&j| distances[text][j])
                .fold(f64::INFINITY, f64::min)
        };

        let target = if position == 0 {
            1
        } else if position == buckets.len() - 1 {
            position - 1
        } else if min_distance(&buckets[position - 1]) <= min_distance(&buckets[position + 1]) {
            position - 1
        } else {
            position + 1
        };

        buckets.remove(position);
        let target = if target > position { target - 1 } else { target };
        buckets[target].push(text);
        buckets[target].sort_by_key(|&i| rank[i]);
    }
}

fn check_invariants(buckets: &[Vec<usize>], n: usize) -> Result<(), BucketingError> {
    if buckets.len() > 1 {
        if let Some(bucket) = buckets.iter().find(|b| b.len() < 2) {
            return Err(BucketingError::Invariant(format!(
                "bucket of {} text(s) among {} buckets",
                bucket.len(),
                buckets.len()
            )));
        }
    }
    let mut seen = vec![false; n];
    for &index in buckets.iter().flatten() {
        if std::mem::replace(&mut seen[index], true) {
            return Err(BucketingError::Invariant(format!("text #{index} appears twice")));
        }
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(BucketingError::Invariant(format!("text #{missing} is in no bucket")));
    }
    Ok(())
}
