//! Principal component projection.
//!
//! The basis comes from the eigendecomposition of the D x D sample covariance
//! of the (already standardized) feature matrix, or of the N x N Gram matrix
//! when there are more features than patients. Eigenvectors carry an
//! arbitrary sign, so each component is flipped until its largest-magnitude
//! loading is positive; for a fixed input the basis is then reproducible
//! bit for bit.

use crate::error::{EvalError, Result};
use crate::features::FeatureMatrix;
use log::{debug, info, warn};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// D x k matrix of principal directions plus the variance each one explains.
#[derive(Clone, Debug)]
pub struct ProjectionBasis {
    components: Array2<f64>,
    explained_variance: Array1<f64>,
}

impl ProjectionBasis {
    /// Columns are principal directions, sorted by decreasing explained variance.
    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    pub fn explained_variance(&self) -> &Array1<f64> {
        &self.explained_variance
    }

    pub fn input_dimensions(&self) -> usize {
        self.components.nrows()
    }

    pub fn num_components(&self) -> usize {
        self.components.ncols()
    }

    /// Maps one vector onto the basis. The vector must have been scaled the same
    /// way as the matrix the basis was fitted on; no centering happens here.
    pub fn project(&self, vector: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        if vector.len() != self.input_dimensions() {
            return Err(EvalError::VectorLength {
                expected: self.input_dimensions(),
                found: vector.len(),
            });
        }
        Ok(vector.dot(&self.components))
    }

    pub fn project_matrix(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        matrix.map_rows(self.num_components(), |row| self.project(row))
    }
}

pub struct Reducer;

impl Reducer {
    /// Fits the top-`k` principal directions. A request above `min(N - 1, D)`
    /// is capped with a warning.
    pub fn fit(matrix: &FeatureMatrix, k: usize) -> Result<ProjectionBasis> {
        if k == 0 {
            return Err(EvalError::InvalidComponents { requested: k });
        }
        let num_rows = matrix.nrows();
        let num_features = matrix.ncols();
        if num_rows < 2 {
            return Err(EvalError::InsufficientSamples {
                required: 2,
                found: num_rows,
            });
        }
        if num_features == 0 {
            return Err(EvalError::EmptyInput {
                context: "PCA requires at least one feature",
            });
        }
        let values = matrix.values();
        FeatureMatrix::check_finite(values)?;

        let max_possible_k = (num_rows - 1).min(num_features);
        let mut k_actual = k;
        if k_actual > max_possible_k {
            warn!(
                "Requested k={} exceeds max possible ({}), adjusting to {}.",
                k, max_possible_k, max_possible_k
            );
            k_actual = max_possible_k;
        }

        let means = values.mean_axis(Axis(0)).ok_or(EvalError::EmptyInput {
            context: "cannot compute feature means",
        })?;
        let centered = &values - &means;

        // Eigenpairs of the smaller of the two symmetric products; for D > N the
        // N x N Gram matrix shares its nonzero spectrum with the covariance.
        let axes: Vec<(f64, Array1<f64>)> = if num_features <= num_rows {
            let covariance = centered.t().dot(&centered) / (num_rows - 1) as f64;
            debug!(
                "Decomposing {}x{} covariance matrix.",
                num_features, num_features
            );
            sorted_eigenpairs(&covariance)
                .into_iter()
                .take(k_actual)
                .collect()
        } else {
            let gram = centered.dot(&centered.t()) / (num_rows - 1) as f64;
            debug!(
                "Decomposing {}x{} Gram matrix ({} features > {} patients).",
                num_rows, num_rows, num_features, num_rows
            );
            sorted_eigenpairs(&gram)
                .into_iter()
                .take(k_actual)
                .map(|(eigval, u)| {
                    let mut axis = centered.t().dot(&u);
                    let norm = axis.dot(&axis).sqrt();
                    if norm > 1e-12 {
                        axis.mapv_inplace(|x| x / norm);
                    } else {
                        axis.fill(0.0);
                    }
                    (eigval, axis)
                })
                .collect()
        };

        let mut components = Array2::<f64>::zeros((num_features, k_actual));
        let mut explained_variance = Array1::<f64>::zeros(k_actual);
        for (out_col, (eigval, mut axis)) in axes.into_iter().enumerate() {
            let pivot = axis
                .iter()
                .copied()
                .fold(0.0f64, |best, v| if v.abs() > best.abs() { v } else { best });
            if pivot < 0.0 {
                axis.mapv_inplace(|x| -x);
            }
            components.column_mut(out_col).assign(&axis);
            // Tiny negative eigenvalues are round-off on a PSD matrix.
            explained_variance[out_col] = eigval.max(0.0);
        }

        info!(
            "PCA fitted: {} features -> {} components, explained variance (first 5): {:?}",
            num_features,
            k_actual,
            explained_variance.iter().take(5).collect::<Vec<_>>()
        );
        Ok(ProjectionBasis {
            components,
            explained_variance,
        })
    }
}

/// Eigenpairs of a symmetric matrix, largest eigenvalue first; equal
/// eigenvalues keep the solver's order.
fn sorted_eigenpairs(matrix: &Array2<f64>) -> Vec<(f64, Array1<f64>)> {
    let dim = matrix.nrows();
    let eigen = DMatrix::from_fn(dim, dim, |i, j| matrix[[i, j]]).symmetric_eigen();
    let mut pairs: Vec<(f64, Array1<f64>)> = eigen
        .eigenvalues
        .iter()
        .zip(eigen.eigenvectors.column_iter())
        .map(|(&val, vec)| (val, Array1::from_iter(vec.iter().copied())))
        .collect();
    pairs.sort_by(|(a, _), (b, _)| b.total_cmp(a));
    pairs
}
