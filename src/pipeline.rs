use ndarray::Array2;
use serde_json::json;
use tracing::info;

use crate::ai::describe::{DescribeConfig, Describer, run_describe_stage, sample_texts};
use crate::cluster::{SearchConfig, StrategyKind, linalg, pca, search_parameters};
use crate::embed::{EmbedConfig, Embedder, run_embedding_stage};
use crate::error::{AppError, AppResult};
use crate::store::{CLUSTER_NOISE, Store};

/// Representative texts kept on each cluster row for report rendering.
const REPRESENTATIVE_SAMPLES: usize = 3;

#[derive(Debug, Clone)]
pub struct ClusterStageOptions {
    pub kind: StrategyKind,
    pub search: SearchConfig,
    /// Components of the projection fed to the clusterer. The 2D chart
    /// projection is always computed separately.
    pub cluster_dims: usize,
}

impl Default for ClusterStageOptions {
    fn default() -> Self {
        Self {
            kind: StrategyKind::Density,
            search: SearchConfig::default(),
            cluster_dims: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterStageSummary {
    pub method: String,
    pub n_clusters: usize,
    pub clustered: usize,
    pub noise: usize,
}

/// Convert embedding rows into a dense matrix for the numeric stages.
fn embeddings_to_matrix(vectors: &[(i64, Vec<f32>)]) -> AppResult<Array2<f64>> {
    let rows = vectors.len();
    let cols = vectors
        .first()
        .map(|(_, v)| v.len())
        .ok_or_else(|| AppError::DegenerateInput("no embedded rows to cluster".to_string()))?;
    let mut matrix = Array2::<f64>::zeros((rows, cols));
    for (i, (id, vector)) in vectors.iter().enumerate() {
        if vector.len() != cols {
            return Err(AppError::DegenerateInput(format!(
                "row {id} has {} dimensions, expected {cols}",
                vector.len()
            )));
        }
        for (j, value) in vector.iter().enumerate() {
            matrix[(i, j)] = f64::from(*value);
        }
    }
    Ok(matrix)
}

/// Run the clustering stage: load embeddings, project them, search the
/// parameter grid, and persist assignments, 2D coordinates, and regenerated
/// cluster rows.
#[tracing::instrument(name = "Clustering feedback", level = "info", skip(store))]
pub async fn run_cluster_stage(
    store: &Store,
    options: &ClusterStageOptions,
) -> AppResult<ClusterStageSummary> {
    let vectors = store.embedded_vectors().await?;
    info!("Clustering {} embedded rows", vectors.len());

    let phase_id = store
        .begin_phase(
            "clustering",
            vectors.len() as i64,
            &json!({
                "strategy": options.kind,
                "cluster_dims": options.cluster_dims,
                "min_k": options.search.min_k,
                "max_k": options.search.max_k,
                "seed": options.search.seed,
            }),
        )
        .await?;

    let matrix = embeddings_to_matrix(&vectors)?;
    let normalized = linalg::normalize_rows(matrix);

    // Two independent projections: one sized for clustering quality, one
    // strictly for the charts. Never reuse one for the other.
    let reduced = pca::project(&normalized, options.cluster_dims)?;
    let run = search_parameters(&reduced, options.kind, &options.search)?;
    let planar = pca::project(&normalized, 2)?;

    store.reset_assignments().await?;
    let assignments: Vec<(i64, i64, f64, f64)> = vectors
        .iter()
        .zip(run.labels.iter())
        .enumerate()
        .map(|(i, ((id, _), &label))| {
            let cluster_id = if label < 0 { CLUSTER_NOISE } else { label };
            (*id, cluster_id, planar[(i, 0)], planar[(i, 1)])
        })
        .collect();
    store.apply_assignments(&assignments).await?;

    // Regenerate the clusters table from scratch; ids are not stable
    // across runs.
    let mut cluster_ids: Vec<i64> = run.labels.iter().copied().filter(|&l| l >= 0).collect();
    cluster_ids.sort_unstable();
    cluster_ids.dedup();
    let mut seeds = Vec::with_capacity(cluster_ids.len());
    for cluster_id in cluster_ids {
        let members = store.cluster_member_texts(cluster_id).await?;
        let samples = sample_texts(
            &members,
            REPRESENTATIVE_SAMPLES,
            options.search.seed ^ cluster_id as u64,
        );
        seeds.push((cluster_id, members.len() as i64, samples));
    }
    store.replace_clusters(&seeds).await?;

    let clustered = run.labels.iter().filter(|&&l| l >= 0).count();
    store
        .finish_phase(phase_id, vectors.len() as i64, 0)
        .await?;

    let summary = ClusterStageSummary {
        method: run.method,
        n_clusters: run.n_clusters,
        clustered,
        noise: run.noise,
    };
    info!(
        "Clustering done with {}: {} clusters, {} assigned, {} noise",
        summary.method, summary.n_clusters, summary.clustered, summary.noise
    );
    Ok(summary)
}

/// The whole pipeline in sequence: embed, cluster, describe, report.
/// Each stage persists its results, so a failed or interrupted run picks
/// up from the stored state on the next invocation.
#[tracing::instrument(
    name = "Running full pipeline",
    level = "info",
    skip(store, embedder, describer)
)]
pub async fn run_full_pipeline(
    store: &Store,
    embedder: &dyn Embedder,
    describer: &dyn Describer,
    embed_config: &EmbedConfig,
    cluster_options: &ClusterStageOptions,
    describe_config: &DescribeConfig,
    out_dir: &std::path::Path,
) -> AppResult<()> {
    let embedded = run_embedding_stage(store, embedder, embed_config).await?;
    info!(
        "Embedding stage: {} embedded, {} failed",
        embedded.embedded, embedded.failed
    );

    let clustered = run_cluster_stage(store, cluster_options).await?;
    info!(
        "Cluster stage: {} clusters via {}",
        clustered.n_clusters, clustered.method
    );

    let described = run_describe_stage(store, describer, describe_config).await?;
    info!(
        "Describe stage: {} described, {} failed",
        described.described, described.failed
    );

    let report = crate::report::run_report_stage(store, out_dir).await?;
    info!("Report stage wrote {} files", report.files.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::store::NewSubmission;

    /// Store with three well-separated groups of embedded feedback.
    async fn seeded_store(per_group: usize) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let centers: [(f32, f32, f32); 3] = [
            (10.0, 0.0, 0.0),
            (0.0, 10.0, 0.0),
            (0.0, 0.0, 10.0),
        ];

        let mut rows = Vec::new();
        let mut embedded = Vec::new();
        for (group, &(cx, cy, cz)) in centers.iter().enumerate() {
            for i in 0..per_group {
                let submission_id = (group * per_group + i) as i64;
                rows.push(NewSubmission {
                    submission_id,
                    feedback: format!(
                        "group {group} comment {i} with plenty of detail to work with"
                    ),
                    program_name: format!("Program {group}"),
                    assignment_name: "Meeting".to_string(),
                    created_at: "2025-05-01T00:00:00Z".to_string(),
                });
                embedded.push((
                    submission_id,
                    vec![
                        cx + rng.random_range(-0.2..0.2),
                        cy + rng.random_range(-0.2..0.2),
                        cz + rng.random_range(-0.2..0.2),
                    ],
                ));
            }
        }
        store.upsert_submissions(&rows).await.unwrap();
        store.store_embedded_batch(&embedded).await.unwrap();
        store
    }

    #[tokio::test]
    async fn cluster_stage_persists_assignments_and_clusters() {
        let store = seeded_store(20).await;
        let options = ClusterStageOptions {
            kind: StrategyKind::Centroid,
            search: SearchConfig {
                min_k: 2,
                max_k: 4,
                ..SearchConfig::default()
            },
            cluster_dims: 3,
        };

        let summary = run_cluster_stage(&store, &options).await.unwrap();
        assert!((2..=4).contains(&summary.n_clusters));

        // Size invariant: assigned + noise covers every embedded row.
        let (clustered, noise) = store.assignment_counts().await.unwrap();
        assert_eq!(clustered + noise, store.embedded_count().await.unwrap());

        let clusters = store.clusters_overview().await.unwrap();
        assert_eq!(clusters.len(), summary.n_clusters);
        let total_size: i64 = clusters.iter().map(|c| c.size).sum();
        assert_eq!(total_size + noise, 60);

        // Every assigned row received 2D coordinates.
        let points = store.scatter_points().await.unwrap();
        assert_eq!(points.len(), 60);

        // Representative samples were captured for the report.
        assert!(
            clusters
                .iter()
                .all(|c| !c.representative_samples.is_empty())
        );
    }

    #[tokio::test]
    async fn rerunning_the_cluster_stage_regenerates_state() {
        let store = seeded_store(20).await;
        let options = ClusterStageOptions {
            kind: StrategyKind::Centroid,
            search: SearchConfig {
                min_k: 3,
                max_k: 3,
                ..SearchConfig::default()
            },
            cluster_dims: 3,
        };

        let first = run_cluster_stage(&store, &options).await.unwrap();
        let second = run_cluster_stage(&store, &options).await.unwrap();

        // Same data, same seed: the rerun reproduces the partition.
        assert_eq!(first.n_clusters, second.n_clusters);
        assert_eq!(first.clustered, second.clustered);
        let clusters = store.clusters_overview().await.unwrap();
        assert_eq!(clusters.len(), 3);
    }

    #[tokio::test]
    async fn clustering_an_empty_store_is_a_named_error() {
        let store = Store::open_in_memory().await.unwrap();
        match run_cluster_stage(&store, &ClusterStageOptions::default()).await {
            Err(AppError::DegenerateInput(_)) => {}
            other => panic!("expected DegenerateInput, got {other:?}"),
        }
    }
}
