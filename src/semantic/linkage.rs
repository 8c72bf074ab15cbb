//! Agglomerative clustering with Ward linkage.
//!
//! The dendrogram uses the usual linkage-matrix layout: leaves are ids
//! `0..n`, and merge step `i` creates cluster id `n + i`.

/// One merge of two clusters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub distance: f64,
    /// Leaves under the new cluster
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct Dendrogram {
    leaves: usize,
    merges: Vec<Merge>,
}

impl Dendrogram {
    /// Ward clustering of a symmetric distance matrix.
    ///
    /// Distances between a merged cluster and the rest follow the
    /// Lance-Williams update for Ward's minimum variance criterion.
    pub fn ward(distances: &[Vec<f64>]) -> Self {
        let n = distances.len();
        let mut d = distances.to_vec();
        let mut size = vec![1usize; n];
        let mut id: Vec<usize> = (0..n).collect();
        let mut active = vec![true; n];
        let mut merges = Vec::with_capacity(n.saturating_sub(1));

        for step in 0..n.saturating_sub(1) {
            let mut best: Option<(usize, usize, f64)> = None;
            for i in (0..n).filter(|&i| active[i]) {
                for j in ((i + 1)..n).filter(|&j| active[j]) {
                    if best.is_none_or(|(_, _, b)| d[i][j] < b) {
                        best = Some((i, j, d[i][j]));
                    }
                }
            }
            let Some((i, j, dist)) = best else {
                break;
            };

            let merged = size[i] + size[j];
            merges.push(Merge {
                left: id[i].min(id[j]),
                right: id[i].max(id[j]),
                distance: dist,
                size: merged,
            });

            for k in (0..n).filter(|&k| active[k] && k != i && k != j) {
                let total = (merged + size[k]) as f64;
                let squared = ((size[i] + size[k]) as f64 * d[i][k].powi(2)
                    + (size[j] + size[k]) as f64 * d[j][k].powi(2)
                    - size[k] as f64 * dist.powi(2))
                    / total;
                let updated = squared.max(0.0).sqrt();
                d[i][k] = updated;
                d[k][i] = updated;
            }
            active[j] = false;
            size[i] = merged;
            id[i] = n + step;
        }

        Self { leaves: n, merges }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves
    }

    pub fn merges(&self) -> &[Merge] {
        &self.merges
    }

    fn root(&self) -> usize {
        self.leaves + self.merges.len() - 1
    }

    fn children(&self, node: usize) -> Option<(usize, usize)> {
        (node >= self.leaves).then(|| {
            let merge = &self.merges[node - self.leaves];
            (merge.left, merge.right)
        })
    }

    /// Leaves under every node, in left-to-right order.
    fn members(&self) -> Vec<Vec<usize>> {
        let mut members: Vec<Vec<usize>> = (0..self.leaves).map(|i| vec![i]).collect();
        for merge in &self.merges {
            let mut joined = members[merge.left].clone();
            joined.extend_from_slice(&members[merge.right]);
            members.push(joined);
        }
        members
    }

    /// Leaves in the order a left-to-right traversal visits them.
    pub fn leaf_order(&self) -> Vec<usize> {
        if self.merges.is_empty() {
            return (0..self.leaves).collect();
        }
        let mut order = Vec::with_capacity(self.leaves);
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            match self.children(node) {
                Some((left, right)) => {
                    stack.push(right);
                    stack.push(left);
                }
                None => order.push(node),
            }
        }
        order
    }

    /// Flips children so that adjacent leaves are as close as possible.
    ///
    /// Dynamic programming over the tree (Bar-Joseph et al. 2001): `cost[u][w]`
    /// is the cheapest ordering of the smallest subtree holding both `u` and
    /// `w` that starts at `u` and ends at `w`.
    pub fn optimal_leaf_ordering(mut self, distances: &[Vec<f64>]) -> Self {
        let n = self.leaves;
        if n < 3 || self.merges.len() + 1 != n {
            return self;
        }
        let members = self.members();
        let mut cost = vec![vec![0.0; n]; n];
        let mut via = vec![0.0; n];

        for merge in &self.merges {
            for (starts, left_ends) in self.end_sets(merge.left, &members) {
                for &u in starts {
                    for &k in &members[merge.right] {
                        via[k] = left_ends
                            .iter()
                            .map(|&m| cost[u][m] + distances[m][k])
                            .fold(f64::INFINITY, f64::min);
                    }
                    for (right_starts, right_ends) in self.end_sets(merge.right, &members) {
                        for &w in right_starts {
                            let best = right_ends
                                .iter()
                                .map(|&k| via[k] + cost[k][w])
                                .fold(f64::INFINITY, f64::min);
                            cost[u][w] = best;
                            cost[w][u] = best;
                        }
                    }
                }
            }
        }

        let root = self.root();
        let (left, right) = (self.merges[root - n].left, self.merges[root - n].right);
        let mut ends = (members[left][0], members[right][0]);
        let mut best = f64::INFINITY;
        for &u in &members[left] {
            for &w in &members[right] {
                if cost[u][w] < best {
                    best = cost[u][w];
                    ends = (u, w);
                }
            }
        }

        let mut swapped = vec![false; self.merges.len()];
        self.orient(root, ends.0, ends.1, &members, &cost, distances, &mut swapped);
        for (merge, swap) in self.merges.iter_mut().zip(swapped) {
            if swap {
                std::mem::swap(&mut merge.left, &mut merge.right);
            }
        }
        self
    }

    /// (start leaves, end leaves they pair with) for orderings of `node`.
    fn end_sets<'a>(&self, node: usize, members: &'a [Vec<usize>]) -> Vec<(&'a [usize], &'a [usize])> {
        match self.children(node) {
            None => vec![(&members[node][..], &members[node][..])],
            Some((a, b)) => vec![(&members[a][..], &members[b][..]), (&members[b][..], &members[a][..])],
        }
    }

    /// Leaves that can end an ordering of `node` starting at `start`.
    fn far_ends<'a>(&self, node: usize, start: usize, members: &'a [Vec<usize>]) -> &'a [usize] {
        match self.children(node) {
            None => &members[node],
            Some((a, b)) if members[a].contains(&start) => &members[b],
            Some((a, _)) => &members[a],
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn orient(
        &self,
        node: usize,
        start: usize,
        end: usize,
        members: &[Vec<usize>],
        cost: &[Vec<f64>],
        distances: &[Vec<f64>],
        swapped: &mut [bool],
    ) {
        let Some((left, right)) = self.children(node) else {
            return;
        };
        let (first, second) = if members[left].contains(&start) {
            (left, right)
        } else {
            swapped[node - self.leaves] = true;
            (right, left)
        };

        let mut best = f64::INFINITY;
        let mut split = (start, end);
        for &a in self.far_ends(first, start, members) {
            for &b in self.far_ends(second, end, members) {
                let c = cost[start][a] + distances[a][b] + cost[b][end];
                if c < best {
                    best = c;
                    split = (a, b);
                }
            }
        }

        self.orient(first, start, split.0, members, cost, distances, swapped);
        self.orient(second, split.1, end, members, cost, distances, swapped);
    }

    /// Flat clustering into at most `max_clusters` clusters.
    ///
    /// Applies the first `n - max_clusters` merges. Labels start at 1 and
    /// are numbered in leaf order.
    pub fn maxclust(&self, max_clusters: usize) -> Vec<usize> {
        let n = self.leaves;
        let cuts = n.saturating_sub(max_clusters.max(1)).min(self.merges.len());

        let mut parent: Vec<usize> = (0..n).collect();
        let mut representative: Vec<usize> = (0..n).collect();
        for merge in &self.merges[..cuts] {
            let a = find(&mut parent, representative[merge.left]);
            let b = find(&mut parent, representative[merge.right]);
            parent[b] = a;
            representative.push(a);
        }

        let mut labels = vec![0; n];
        let mut root_label = vec![0; n];
        let mut next = 0;
        for leaf in self.leaf_order() {
            let root = find(&mut parent, leaf);
            if root_label[root] == 0 {
                next += 1;
                root_label[root] = next;
            }
            labels[leaf] = root_label[root];
        }
        labels
    }
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}
