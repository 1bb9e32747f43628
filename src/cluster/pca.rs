use ndarray::prelude::*;
use ndarray_linalg::*;

use crate::error::{AppError, AppResult};

/// Reduction below this many points is refused; the projection would be
/// meaningless and the clusterer downstream needs more support anyway.
pub const MIN_POINTS: usize = 15;

/// Project row vectors onto their top principal components.
///
/// The decomposition is deterministic, so two runs over the same input give
/// identical coordinates. The clustering projection and the 2D chart
/// projection are separate calls with separate component counts; their
/// outputs are never interchangeable.
#[tracing::instrument(name = "Projecting embeddings", level = "debug", skip(data))]
pub fn project(data: &Array2<f64>, n_components: usize) -> AppResult<Array2<f64>> {
    let n_samples = data.nrows();
    let n_features = data.ncols();
    if n_samples < MIN_POINTS {
        return Err(AppError::DegenerateInput(format!(
            "{n_samples} vectors is below the {MIN_POINTS}-point minimum for projection"
        )));
    }

    let mean: Array1<f64> = data
        .mean_axis(Axis(0))
        .ok_or_else(|| AppError::DegenerateInput("no rows to project".to_string()))?;
    let mut centered: Array2<f64> = data.clone();
    for mut row in centered.axis_iter_mut(Axis(0)) {
        row -= &mean;
    }

    let total_variance: f64 = centered.mapv(|v| v * v).sum();
    if total_variance <= f64::EPSILON * n_samples as f64 {
        return Err(AppError::DegenerateInput(
            "all vectors are identical; nothing to project".to_string(),
        ));
    }

    let k = n_components.min(n_features).min(n_samples);
    let (_, _, vt) = centered.svd(false, true)?;
    let vt: Array2<f64> = vt.ok_or_else(|| {
        AppError::Other("SVD did not return right singular vectors".to_string())
    })?;
    let components = vt.slice(s![0..k, ..]);
    Ok(centered.dot(&components.t()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_data(n: usize) -> Array2<f64> {
        // Points along a line in 3D with slight thickness in one direction.
        let mut data = Array2::<f64>::zeros((n, 3));
        for i in 0..n {
            let t = i as f64;
            data[(i, 0)] = t;
            data[(i, 1)] = 2.0 * t;
            data[(i, 2)] = if i % 2 == 0 { 0.01 } else { -0.01 };
        }
        data
    }

    #[test]
    fn projects_to_requested_dimension() {
        let data = line_data(20);
        let reduced = project(&data, 2).unwrap();
        assert_eq!(reduced.dim(), (20, 2));
    }

    #[test]
    fn first_component_captures_the_dominant_direction() {
        let data = line_data(20);
        let reduced = project(&data, 2).unwrap();
        // Variance along component 0 dwarfs component 1.
        let var = |col: ArrayView1<f64>| {
            let mean = col.mean().unwrap();
            col.mapv(|v| (v - mean) * (v - mean)).sum()
        };
        assert!(var(reduced.column(0)) > 100.0 * var(reduced.column(1)));
    }

    #[test]
    fn projection_is_deterministic() {
        let data = line_data(30);
        let a = project(&data, 2).unwrap();
        let b = project(&data, 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn too_few_points_is_a_named_error() {
        let data = Array2::<f64>::zeros((5, 3));
        match project(&data, 2) {
            Err(AppError::DegenerateInput(_)) => {}
            other => panic!("expected DegenerateInput, got {other:?}"),
        }
    }

    #[test]
    fn identical_vectors_are_a_named_error() {
        let data = Array2::<f64>::ones((20, 4));
        match project(&data, 2) {
            Err(AppError::DegenerateInput(_)) => {}
            other => panic!("expected DegenerateInput, got {other:?}"),
        }
    }

    #[test]
    fn component_count_is_clamped_to_the_input_rank() {
        let data = line_data(20);
        let reduced = project(&data, 50).unwrap();
        assert_eq!(reduced.dim(), (20, 3));
    }
}
