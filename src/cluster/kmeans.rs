use ndarray::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::cluster::linalg::row_norms;
use crate::error::{AppError, AppResult};

static CHUNK_SIZE: usize = 256;

/// Result of one k-means fit.
#[derive(Debug, Clone)]
pub struct KmeansFit {
    pub labels: Vec<usize>,
    pub inertia: f64,
    pub centers: Array2<f64>,
    pub iterations: usize,
}

/// Sum of squared distances from each point to its assigned center.
fn inertia_dense(
    x: &Array2<f64>,        // x = (n_samples, n_features)
    centers: &Array2<f64>,  // centers = (n_clusters, n_features)
    labels: &[usize],       // labels = (n_samples,)
) -> f64 {
    let mut inertia = 0.0;
    for (i, &label) in labels.iter().enumerate() {
        let diff = &x.row(i) - &centers.row(label);
        inertia += diff.mapv(|v| v * v).sum();
    }
    inertia
}

fn assign_chunk_dense(
    x_chunk: &Array2<f64>,               // x_chunk = (chunk_size, n_features)
    centers_old: &Array2<f64>,           // centers_old = (n_clusters, n_features)
    centers_squared_norms: &Array1<f64>, // centers_squared_norms = (n_clusters,)
    update_centers: bool,
) -> (Vec<usize>, Array2<f64>, Array1<f64>) {
    let n_samples = x_chunk.nrows();
    let n_features = x_chunk.ncols();
    let n_clusters = centers_old.nrows();

    // pairwise = (chunk_size, n_clusters), expanded squared distances
    let mut pairwise = x_chunk.dot(&centers_old.t());
    pairwise.mapv_inplace(|v| -2.0 * v);

    let x_sq = row_norms(x_chunk, true)
        .to_shape((n_samples, 1))
        .expect("reshape x norms")
        .to_owned();
    pairwise += &x_sq.broadcast((n_samples, n_clusters)).unwrap();

    let centers_sq = centers_squared_norms
        .clone()
        .to_shape((1, n_clusters))
        .expect("reshape center norms")
        .to_owned();
    pairwise += &centers_sq.broadcast((n_samples, n_clusters)).unwrap();

    let mut labels_chunk = vec![0usize; n_samples];
    let mut centers_new_chunk = Array2::<f64>::zeros((n_clusters, n_features));
    let mut counts_chunk = Array1::<f64>::zeros(n_clusters);

    for i in 0..n_samples {
        let distances_row = pairwise.row(i);
        let (label, _) = distances_row
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        labels_chunk[i] = label;

        if update_centers {
            counts_chunk[label] += 1.0;
            for k in 0..n_features {
                centers_new_chunk[(label, k)] += x_chunk[(i, k)];
            }
        }
    }

    (labels_chunk, centers_new_chunk, counts_chunk)
}

/// Single Lloyd iteration split into chunks to limit temporary allocations.
fn lloyd_iter_chunked_dense(
    x: &Array2<f64>,           // x = (n_samples, n_features)
    centers_old: &Array2<f64>, // centers_old = (n_clusters, n_features)
    update_centers: bool,
) -> (Array2<f64>, Vec<usize>, Array1<f64>) {
    let n_samples = x.nrows();
    let n_features = x.ncols();
    let n_clusters = centers_old.nrows();

    if n_samples == 0 {
        return (
            centers_old.clone(),
            Vec::new(),
            Array1::<f64>::zeros(n_clusters),
        );
    }

    let n_samples_chunk = n_samples.min(CHUNK_SIZE);
    let mut n_chunks = n_samples / n_samples_chunk;
    let n_samples_rem = n_samples % n_samples_chunk;
    if n_samples != n_chunks * n_samples_chunk {
        n_chunks += 1;
    }

    let centers_squared_norms = row_norms(centers_old, true);
    let mut centers_new = Array2::<f64>::zeros((n_clusters, n_features));
    let mut counts = Array1::<f64>::zeros(n_clusters);
    let mut labels = vec![0usize; n_samples];

    for chunk_idx in 0..n_chunks {
        let start = chunk_idx * n_samples_chunk;
        let end = if chunk_idx == n_chunks - 1 && n_samples_rem > 0 {
            start + n_samples_rem
        } else {
            start + n_samples_chunk
        };

        let x_chunk = x.slice(s![start..end, ..]).to_owned();
        let (labels_chunk, centers_new_chunk, counts_chunk) =
            assign_chunk_dense(&x_chunk, centers_old, &centers_squared_norms, update_centers);

        labels[start..end].copy_from_slice(&labels_chunk);

        if update_centers {
            centers_new += &centers_new_chunk;
            counts += &counts_chunk;
        }
    }

    let mut center_shift = Array1::<f64>::zeros(n_clusters);

    if update_centers {
        for cluster in 0..n_clusters {
            if counts[cluster] > 0.0 {
                for k in 0..n_features {
                    centers_new[(cluster, k)] /= counts[cluster];
                }
            } else {
                // keep previous center if cluster is empty
                centers_new
                    .row_mut(cluster)
                    .assign(&centers_old.row(cluster));
            }
        }

        let diff = centers_old - &centers_new; // (n_clusters, n_features)
        center_shift = row_norms(&diff, false); // (n_clusters,)
    } else {
        centers_new = centers_old.clone();
    }

    (centers_new, labels, center_shift)
}

/// Run a single K-Means from the given initial centers using Lloyd's
/// algorithm. Returns (labels, inertia, centers, n_iter).
fn kmeans_single_lloyd(
    x: &Array2<f64>,
    centers_init: &Array2<f64>,
    max_iter: usize,
    tol: f64,
) -> (Vec<usize>, f64, Array2<f64>, usize) {
    let n_samples = x.nrows();

    let mut centers = centers_init.clone();
    let mut labels = vec![0usize; n_samples];
    let mut labels_old = vec![usize::MAX; n_samples];
    let mut strict_convergence = false;
    let mut iterations = 0;

    for i in 0..max_iter {
        let (centers_new, new_labels, center_shift) = lloyd_iter_chunked_dense(x, &centers, true);

        iterations = i + 1;

        if new_labels == labels_old {
            centers = centers_new;
            labels = new_labels;
            strict_convergence = true;
            break;
        }

        let center_shift_tot: f64 = center_shift.iter().map(|v| v * v).sum();

        centers = centers_new;
        labels = new_labels.clone();
        labels_old = new_labels;

        if center_shift_tot <= tol {
            break;
        }
    }

    if !strict_convergence {
        // Ensure labels reflect final centers
        let (_, refreshed_labels, _) = lloyd_iter_chunked_dense(x, &centers, false);
        labels = refreshed_labels;
    }

    let inertia = inertia_dense(x, &centers, &labels);

    (labels, inertia, centers, iterations)
}

/// Pick k distinct rows as initial centers, deterministically for a seed.
fn seeded_centers(x: &Array2<f64>, k: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let picks = rand::seq::index::sample(&mut rng, x.nrows(), k);
    let mut centers = Array2::<f64>::zeros((k, x.ncols()));
    for (row, idx) in picks.into_iter().enumerate() {
        centers.row_mut(row).assign(&x.row(idx));
    }
    centers
}

/// Full fixed-k clustering: `n_init` seeded restarts, keeping the fit with
/// the lowest inertia. Reproducible for a fixed seed.
pub fn kmeans(
    x: &Array2<f64>,
    k: usize,
    seed: u64,
    n_init: usize,
    max_iter: usize,
    tol: f64,
) -> AppResult<KmeansFit> {
    let n_samples = x.nrows();
    if k == 0 || k > n_samples {
        return Err(AppError::DegenerateInput(format!(
            "cannot fit {k} centroids to {n_samples} points"
        )));
    }

    let mut best: Option<KmeansFit> = None;
    for restart in 0..n_init.max(1) {
        let centers_init = seeded_centers(x, k, seed.wrapping_add(restart as u64));
        let (labels, inertia, centers, iterations) =
            kmeans_single_lloyd(x, &centers_init, max_iter, tol);
        if best.as_ref().is_none_or(|b| inertia < b.inertia) {
            best = Some(KmeansFit {
                labels,
                inertia,
                centers,
                iterations,
            });
        }
    }
    Ok(best.expect("at least one restart ran"))
}
