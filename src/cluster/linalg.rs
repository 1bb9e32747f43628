use hdbscan::{DistanceMetric, Hdbscan, HdbscanHyperParams, NnAlgorithm};
use ndarray::prelude::*;
use ndarray::{OwnedRepr, RemoveAxis};

use crate::error::{AppError, AppResult};

pub fn row_norms<D>(
    x: &ArrayBase<OwnedRepr<f64>, D>,
    squared: bool,
) -> ArrayBase<OwnedRepr<f64>, D::Smaller>
where
    D: Dimension + RemoveAxis,
{
    let prod: ArrayBase<OwnedRepr<f64>, D> = x * x;
    let sum: ArrayBase<OwnedRepr<f64>, D::Smaller> = prod.sum_axis(Axis(1));
    if !squared { sum.sqrt() } else { sum }
}

/// L2-normalize each row. Euclidean distance between unit rows tracks
/// cosine distance, which is the metric the embeddings are meant for.
#[tracing::instrument(name = "Normalizing embeddings", level = "debug", skip(data))]
pub fn normalize_rows(data: Array2<f64>) -> Array2<f64> {
    let (norm, _) = ndarray_linalg::norm::normalize(data, ndarray_linalg::norm::NormalizeAxis::Row);
    norm
}

/// Density clustering over reduced vectors. Returns one label per row;
/// -1 marks noise the algorithm declined to assign.
#[tracing::instrument(name = "Density clustering", level = "debug", skip(data))]
pub fn cluster_density(
    data: &Array2<f64>,
    min_cluster_size: usize,
    epsilon: f64,
) -> AppResult<Vec<i64>> {
    let params = HdbscanHyperParams::builder()
        .min_cluster_size(min_cluster_size)
        .epsilon(epsilon)
        .dist_metric(DistanceMetric::Euclidean)
        .nn_algorithm(NnAlgorithm::Auto)
        .build();
    let rows = data
        .axis_iter(Axis(0))
        .map(|row| row.to_vec())
        .collect::<Vec<Vec<f64>>>();
    let hdbscan = Hdbscan::new(&rows, params);
    let labels = hdbscan
        .cluster()
        .map_err(|e| AppError::Clustering(format!("{e:?}")))?;
    Ok(labels.into_iter().map(i64::from).collect())
}

/// Mean silhouette coefficient over all points: cohesion against the own
/// cluster versus separation from the nearest other cluster. Points in
/// singleton clusters contribute zero.
pub fn silhouette_score(data: &Array2<f64>, labels: &[usize]) -> f64 {
    let n = data.nrows();
    if n == 0 {
        return 0.0;
    }
    let n_clusters = labels.iter().copied().max().map_or(0, |m| m + 1);
    if n_clusters < 2 {
        return 0.0;
    }

    let mut cluster_sizes = vec![0usize; n_clusters];
    for &label in labels {
        cluster_sizes[label] += 1;
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        if cluster_sizes[own] <= 1 {
            continue;
        }

        // Mean distance from point i to every cluster.
        let mut dist_sums = vec![0.0f64; n_clusters];
        for j in 0..n {
            if i == j {
                continue;
            }
            let diff = &data.row(i) - &data.row(j);
            let dist = diff.mapv(|v| v * v).sum().sqrt();
            dist_sums[labels[j]] += dist;
        }

        let a = dist_sums[own] / (cluster_sizes[own] - 1) as f64;
        let b = (0..n_clusters)
            .filter(|&c| c != own && cluster_sizes[c] > 0)
            .map(|c| dist_sums[c] / cluster_sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);

        if b.is_finite() {
            let denom = a.max(b);
            if denom > 0.0 {
                total += (b - a) / denom;
            }
        }
    }
    total / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_norms_squared_and_unsquared() {
        let x = array![[3.0, 4.0], [1.0, 2.0]]; // norms: 5 and sqrt(5)
        let squared = row_norms(&x, true);
        let unsquared = row_norms(&x, false);
        assert_eq!(squared, arr1(&[25.0, 5.0]));
        assert!((unsquared[0] - 5.0).abs() < 1e-10);
        assert!((unsquared[1] - 5.0_f64.sqrt()).abs() < 1e-10);
    }

    #[test]
    fn normalize_rows_to_unit_norm() {
        let data = array![[3.0, 4.0], [0.0, 5.0]];
        let normed = normalize_rows(data);
        for row in normed.axis_iter(Axis(0)) {
            let norm: f64 = row.mapv(|v| v * v).sum().sqrt();
            assert!((norm - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn silhouette_prefers_separated_clusters() {
        // Two tight, far-apart groups: near-perfect silhouette.
        let tight = array![[0.0, 0.0], [0.1, 0.0], [10.0, 10.0], [10.1, 10.0]];
        let labels = vec![0, 0, 1, 1];
        let good = silhouette_score(&tight, &labels);
        assert!(good > 0.9, "expected high score, got {good}");

        // The same points labeled across the groups score poorly.
        let mixed = vec![0, 1, 0, 1];
        let bad = silhouette_score(&tight, &mixed);
        assert!(bad < 0.0, "expected negative score, got {bad}");
    }

    #[test]
    fn silhouette_is_zero_for_a_single_cluster() {
        let data = array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
        assert_eq!(silhouette_score(&data, &[0, 0, 0]), 0.0);
    }
}
