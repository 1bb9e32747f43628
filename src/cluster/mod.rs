pub mod kmeans;
pub mod linalg;
pub mod pca;

use ndarray::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

/// Parameters for density clustering.
#[derive(Debug, Clone, Serialize)]
pub struct DensityParams {
    pub min_cluster_size: usize,
    pub epsilon: f64,
}

/// Parameters for fixed-k centroid clustering.
#[derive(Debug, Clone, Serialize)]
pub struct CentroidParams {
    pub k: usize,
    pub n_init: usize,
}

/// The two supported clustering strategies.
#[derive(Debug, Clone, Serialize)]
pub enum Strategy {
    Density(DensityParams),
    Centroid(CentroidParams),
}

/// Which strategy family a parameter search sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StrategyKind {
    Density,
    Centroid,
}

/// One clustering result: a label per input row (-1 = unassigned noise),
/// plus enough bookkeeping to compare candidate configurations.
#[derive(Debug, Clone)]
pub struct ClusteringRun {
    pub labels: Vec<i64>,
    pub method: String,
    pub n_clusters: usize,
    pub noise: usize,
    pub score: f64,
}

const KMEANS_MAX_ITER: usize = 300;
const KMEANS_TOL: f64 = 1e-6;

/// Execute one strategy with fixed parameters.
#[tracing::instrument(name = "Clustering", level = "debug", skip(data))]
pub fn run_strategy(data: &Array2<f64>, strategy: &Strategy, seed: u64) -> AppResult<ClusteringRun> {
    match strategy {
        Strategy::Density(params) => {
            let labels = linalg::cluster_density(data, params.min_cluster_size, params.epsilon)?;
            let n_clusters = count_clusters(&labels);
            let noise = labels.iter().filter(|&&l| l < 0).count();
            let noise_ratio = noise as f64 / labels.len().max(1) as f64;
            Ok(ClusteringRun {
                labels,
                method: format!("density(min_size={})", params.min_cluster_size),
                n_clusters,
                noise,
                score: 1.0 - noise_ratio,
            })
        }
        Strategy::Centroid(params) => {
            let fit = kmeans::kmeans(data, params.k, seed, params.n_init, KMEANS_MAX_ITER, KMEANS_TOL)?;
            let score = linalg::silhouette_score(data, &fit.labels);
            Ok(ClusteringRun {
                labels: fit.labels.into_iter().map(|l| l as i64).collect(),
                method: format!("centroid(k={})", params.k),
                n_clusters: params.k,
                noise: 0,
                score,
            })
        }
    }
}

fn count_clusters(labels: &[i64]) -> usize {
    labels
        .iter()
        .filter(|&&l| l >= 0)
        .collect::<std::collections::HashSet<_>>()
        .len()
}

/// Configuration for the parameter search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchConfig {
    /// Acceptable cluster-count range, inclusive.
    pub min_k: usize,
    pub max_k: usize,
    /// Minimum-cluster-size candidates swept by the density strategy.
    pub density_grid: Vec<usize>,
    pub epsilon: f64,
    pub n_init: usize,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_k: 4,
            max_k: 10,
            density_grid: vec![15, 30, 50, 100, 200],
            epsilon: 0.0,
            n_init: 10,
            seed: 42,
        }
    }
}

/// Sweep a small grid for the chosen strategy and pick the configuration
/// whose cluster count lands inside `[min_k, max_k]`.
///
/// Density candidates are ranked by a blend of low noise ratio and
/// closeness of the cluster count to the middle of the range; centroid
/// candidates by silhouette. If nothing lands in range the caller gets an
/// explicit error, never a silently out-of-range answer.
#[tracing::instrument(name = "Searching cluster parameters", level = "info", skip(data))]
pub fn search_parameters(
    data: &Array2<f64>,
    kind: StrategyKind,
    config: &SearchConfig,
) -> AppResult<ClusteringRun> {
    if config.min_k == 0 || config.max_k < config.min_k {
        return Err(AppError::DegenerateInput(format!(
            "invalid target range [{}, {}]",
            config.min_k, config.max_k
        )));
    }

    let midpoint = (config.min_k + config.max_k) as f64 / 2.0;
    let span = (config.max_k - config.min_k).max(1) as f64;
    let mut best: Option<ClusteringRun> = None;
    let mut swept = 0usize;

    let candidates: Vec<Strategy> = match kind {
        StrategyKind::Density => config
            .density_grid
            .iter()
            .map(|&min_cluster_size| {
                Strategy::Density(DensityParams {
                    min_cluster_size,
                    epsilon: config.epsilon,
                })
            })
            .collect(),
        StrategyKind::Centroid => (config.min_k..=config.max_k)
            .map(|k| {
                Strategy::Centroid(CentroidParams {
                    k,
                    n_init: config.n_init,
                })
            })
            .collect(),
    };

    for strategy in &candidates {
        swept += 1;
        let run = match run_strategy(data, strategy, config.seed) {
            Ok(run) => run,
            // A candidate the data cannot support drops out of the sweep
            // without aborting its siblings.
            Err(AppError::DegenerateInput(reason)) | Err(AppError::Clustering(reason)) => {
                debug!("Skipping {strategy:?}: {reason}");
                continue;
            }
            Err(err) => return Err(err),
        };
        debug!(
            "{}: {} clusters, {} noise, score {:.3}",
            run.method, run.n_clusters, run.noise, run.score
        );
        if run.n_clusters < config.min_k || run.n_clusters > config.max_k {
            continue;
        }

        let ranked_score = match kind {
            // Low noise and a cluster count near the middle of the range.
            StrategyKind::Density => {
                let noise_ratio = run.noise as f64 / run.labels.len().max(1) as f64;
                (1.0 - noise_ratio) - (run.n_clusters as f64 - midpoint).abs() / span
            }
            StrategyKind::Centroid => run.score,
        };

        if best.as_ref().is_none_or(|b| ranked_score > b.score) {
            best = Some(ClusteringRun {
                score: ranked_score,
                ..run
            });
        }
    }

    match best {
        Some(run) => {
            info!(
                "Selected {} with {} clusters and {} noise points",
                run.method, run.n_clusters, run.noise
            );
            Ok(run)
        }
        None => Err(AppError::NoSatisfyingConfiguration(format!(
            "swept {swept} {kind:?} configurations, none produced {}..={} clusters",
            config.min_k, config.max_k
        ))),
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    /// Three tight blobs of 50 points each plus 10 far-flung outliers.
    fn blobs_with_outliers() -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(7);
        let centers = [(0.0, 0.0), (25.0, 0.0), (0.0, 25.0)];
        let mut rows: Vec<f64> = Vec::with_capacity(160 * 2);
        for &(cx, cy) in &centers {
            for _ in 0..50 {
                rows.push(cx + rng.random_range(-1.0..1.0));
                rows.push(cy + rng.random_range(-1.0..1.0));
            }
        }
        for _ in 0..10 {
            rows.push(rng.random_range(60.0..120.0));
            rows.push(rng.random_range(60.0..120.0));
        }
        Array2::from_shape_vec((160, 2), rows).unwrap()
    }

    #[test]
    fn density_finds_three_blobs_and_noise() {
        let data = blobs_with_outliers();
        let run = run_strategy(
            &data,
            &Strategy::Density(DensityParams {
                min_cluster_size: 30,
                epsilon: 0.0,
            }),
            42,
        )
        .unwrap();

        assert_eq!(run.n_clusters, 3);
        assert!(run.noise >= 1, "expected noise points, got {}", run.noise);
        let assigned = run.labels.iter().filter(|&&l| l >= 0).count();
        assert_eq!(assigned + run.noise, 160);
    }

    #[test]
    fn centroid_assigns_every_point() {
        let data = blobs_with_outliers();
        let run = run_strategy(
            &data,
            &Strategy::Centroid(CentroidParams { k: 3, n_init: 10 }),
            42,
        )
        .unwrap();

        assert_eq!(run.noise, 0);
        assert_eq!(run.labels.len(), 160);
        assert_eq!(run.n_clusters, 3);
    }

    #[test]
    fn density_clustering_is_reproducible() {
        let data = blobs_with_outliers();
        let strategy = Strategy::Density(DensityParams {
            min_cluster_size: 30,
            epsilon: 0.0,
        });
        let first = run_strategy(&data, &strategy, 42).unwrap();
        let second = run_strategy(&data, &strategy, 42).unwrap();
        assert_eq!(first.labels, second.labels);
    }

    #[test]
    fn centroid_clustering_is_reproducible_for_a_seed() {
        let data = blobs_with_outliers();
        let strategy = Strategy::Centroid(CentroidParams { k: 4, n_init: 10 });
        let first = run_strategy(&data, &strategy, 99).unwrap();
        let second = run_strategy(&data, &strategy, 99).unwrap();
        assert_eq!(first.labels, second.labels);
    }

    #[test]
    fn search_selects_an_in_range_configuration_when_one_exists() {
        let data = blobs_with_outliers();
        let config = SearchConfig {
            min_k: 2,
            max_k: 5,
            density_grid: vec![10, 30, 80],
            ..SearchConfig::default()
        };

        let run = search_parameters(&data, StrategyKind::Density, &config).unwrap();
        assert!(
            (config.min_k..=config.max_k).contains(&run.n_clusters),
            "selected {} clusters outside [{}, {}]",
            run.n_clusters,
            config.min_k,
            config.max_k
        );
    }

    #[test]
    fn search_with_no_satisfying_configuration_is_an_error() {
        let data = blobs_with_outliers();
        let config = SearchConfig {
            min_k: 7,
            max_k: 9,
            // Far larger than any real group: density cannot reach the range.
            density_grid: vec![150],
            ..SearchConfig::default()
        };

        match search_parameters(&data, StrategyKind::Density, &config) {
            Err(AppError::NoSatisfyingConfiguration(_)) => {}
            other => panic!("expected NoSatisfyingConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn centroid_search_stays_in_range() {
        let data = blobs_with_outliers();
        let config = SearchConfig {
            min_k: 2,
            max_k: 4,
            ..SearchConfig::default()
        };

        let run = search_parameters(&data, StrategyKind::Centroid, &config).unwrap();
        assert!((2..=4).contains(&run.n_clusters));
    }
}
