//! Dense linear algebra used to reduce and compare embeddings.
//!
//! Sizes here are bounded by the number of texts being bucketed, so plain
//! row-major `Vec<Vec<f64>>` matrices and O(n^3) routines are enough.

/// Jacobi sweeps before giving up on further convergence.
const MAX_SWEEPS: usize = 100;

/// Relative off-diagonal mass at which the Jacobi iteration stops.
const JACOBI_TOLERANCE: f64 = 1e-24;

/// Standard deviation below which a column is treated as constant.
const ZERO_VARIANCE: f64 = 1e-12;

/// Result of projecting rows onto their principal axes.
#[derive(Debug, Clone)]
pub struct Projection {
    pub rows: Vec<Vec<f64>>,
    /// Share of the total variance kept by the retained components
    pub explained_variance: f64,
}

/// Centers every column and divides it by its population standard deviation.
///
/// Constant columns are centered but left unscaled.
pub fn standard_scale(rows: &mut [Vec<f64>]) {
    let n = rows.len();
    let Some(dim) = rows.first().map(Vec::len) else {
        return;
    };

    for j in 0..dim {
        let mean = rows.iter().map(|r| r[j]).sum::<f64>() / n as f64;
        let variance = rows.iter().map(|r| (r[j] - mean).powi(2)).sum::<f64>() / n as f64;
        let std = variance.sqrt();
        let scale = if std > ZERO_VARIANCE { std } else { 1.0 };
        for row in rows.iter_mut() {
            row[j] = (row[j] - mean) / scale;
        }
    }
}

/// Projects column-centered `rows` onto their top `components` principal axes.
///
/// Works on the n×n Gram matrix, so the cost depends on the number of rows
/// rather than the embedding dimension.
pub fn pca(rows: &[Vec<f64>], components: usize) -> Projection {
    let n = rows.len();
    let mut gram = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let dot: f64 = rows[i].iter().zip(&rows[j]).map(|(a, b)| a * b).sum();
            gram[i][j] = dot;
            gram[j][i] = dot;
        }
    }

    let (values, vectors) = symmetric_eigen(gram);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

    let keep = components.min(n);
    let total: f64 = values.iter().map(|v| v.max(0.0)).sum();
    let kept: f64 = order[..keep].iter().map(|&k| values[k].max(0.0)).sum();

    let projected = (0..n)
        .map(|i| {
            order[..keep]
                .iter()
                .map(|&k| vectors[k][i] * values[k].max(0.0).sqrt())
                .collect()
        })
        .collect();

    Projection {
        rows: projected,
        explained_variance: if total > 0.0 { kept / total } else { 1.0 },
    }
}

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns the eigenvalues and, at the same index, their unit eigenvectors.
pub fn symmetric_eigen(mut a: Vec<Vec<f64>>) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = a.len();
    let mut v: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    let scale: f64 = a.iter().flatten().map(|x| x * x).sum();
    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[p][q] * a[p][q];
            }
        }
        if off <= JACOBI_TOLERANCE * scale {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p][q];
                if apq.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for row in a.iter_mut() {
                    let (akp, akq) = (row[p], row[q]);
                    row[p] = c * akp - s * akq;
                    row[q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[p][k], a[q][k]);
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for row in v.iter_mut() {
                    let (vkp, vkq) = (row[p], row[q]);
                    row[p] = c * vkp - s * vkq;
                    row[q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let values = (0..n).map(|i| a[i][i]).collect();
    let vectors = (0..n).map(|k| (0..n).map(|i| v[i][k]).collect()).collect();
    (values, vectors)
}

/// Symmetric Euclidean distance matrix with an exact zero diagonal.
pub fn euclidean_distances(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = rows.len();
    let mut d = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            if i != j {
                d[i][j] = rows[i]
                    .iter()
                    .zip(&rows[j])
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    .sqrt();
            }
        }
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let mean = (d[i][j] + d[j][i]) / 2.0;
            d[i][j] = mean;
            d[j][i] = mean;
        }
    }
    d
}
