//! Per-dimension zero-mean / unit-variance scaling.

use crate::error::{EvalError, Result};
use crate::features::FeatureMatrix;
use log::{debug, info, warn};
use ndarray::{Array1, ArrayView1, Axis, Zip};

/// Mean and sample standard deviation of every feature dimension, fitted once
/// over the full population and then applied to every row alike.
#[derive(Clone, Debug)]
pub struct ScalingParameters {
    means: Array1<f64>,
    std_devs: Array1<f64>,
    zero_variance: Vec<usize>,
}

impl ScalingParameters {
    pub fn means(&self) -> &Array1<f64> {
        &self.means
    }

    pub fn std_devs(&self) -> &Array1<f64> {
        &self.std_devs
    }

    /// Dimensions whose variance was zero; these map to 0.0 after transform.
    pub fn zero_variance_dimensions(&self) -> &[usize] {
        &self.zero_variance
    }

    pub fn dimensions(&self) -> usize {
        self.means.len()
    }

    /// Centers and scales one vector. Zero-variance dimensions are centered only,
    /// which leaves them at exactly 0.0.
    pub fn transform(&self, vector: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        if vector.len() != self.dimensions() {
            return Err(EvalError::VectorLength {
                expected: self.dimensions(),
                found: vector.len(),
            });
        }
        let mut out = Array1::<f64>::zeros(vector.len());
        Zip::from(&mut out)
            .and(&vector)
            .and(&self.means)
            .and(&self.std_devs)
            .for_each(|o, &x, &mean, &sd| {
                *o = if sd > 0.0 { (x - mean) / sd } else { 0.0 };
            });
        Ok(out)
    }

    /// Transforms every row of `matrix`, keeping the patient association.
    pub fn transform_matrix(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        matrix.map_rows(self.dimensions(), |row| self.transform(row))
    }
}

const ROUNDOFF_ULPS: f64 = 16.0;

pub struct Standardizer;

impl Standardizer {
    /// Fits per-dimension mean and sample (n - 1) standard deviation.
    pub fn fit(matrix: &FeatureMatrix) -> Result<ScalingParameters> {
        let num_rows = matrix.nrows();
        if num_rows < 2 {
            return Err(EvalError::InsufficientSamples {
                required: 2,
                found: num_rows,
            });
        }
        let values = matrix.values();
        FeatureMatrix::check_finite(values)?;

        let means = values.mean_axis(Axis(0)).ok_or(EvalError::EmptyInput {
            context: "cannot compute feature means",
        })?;

        let mut std_devs = Array1::<f64>::zeros(values.ncols());
        let mut zero_variance = Vec::new();
        for (col_idx, column) in values.axis_iter(Axis(1)).enumerate() {
            let mean = means[col_idx];
            let sum_sq_diff: f64 = column.iter().map(|&x| (x - mean).powi(2)).sum();
            let std_dev = (sum_sq_diff / (num_rows - 1) as f64).sqrt();
            // A constant column can still show a spread of a few ulps of its
            // largest magnitude after the mean is rounded.
            let magnitude = column.iter().fold(0.0f64, |acc, &x| acc.max(x.abs()));
            if std_dev <= ROUNDOFF_ULPS * f64::EPSILON * magnitude {
                zero_variance.push(col_idx);
            } else {
                std_devs[col_idx] = std_dev;
            }
        }

        if !zero_variance.is_empty() {
            warn!(
                "{} of {} feature dimensions have zero variance and will be left at 0 after centering (first 5: {:?}).",
                zero_variance.len(),
                values.ncols(),
                zero_variance.iter().take(5).collect::<Vec<_>>()
            );
        }
        info!(
            "Fitted scaling parameters over {} patients x {} features.",
            num_rows,
            values.ncols()
        );
        debug!("Feature means (first 5): {:?}", means.iter().take(5).collect::<Vec<_>>());

        Ok(ScalingParameters {
            means,
            std_devs,
            zero_variance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::PatientId;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn matrix(values: Array2<f64>) -> FeatureMatrix {
        let ids = (0..values.nrows())
            .map(|i| PatientId(format!("p{i}")))
            .collect();
        FeatureMatrix::new(ids, values).unwrap()
    }

    #[test]
    fn test_fit_then_transform_is_standardized() {
        let m = matrix(array![
            [1.0, 10.0, 5.0],
            [2.0, 30.0, 5.0],
            [3.0, 20.0, 5.0],
            [6.0, 60.0, 5.0]
        ]);
        let params = Standardizer::fit(&m).unwrap();
        let scaled = params.transform_matrix(&m).unwrap();
        let values = scaled.values();

        for col in 0..2 {
            let column = values.column(col);
            assert_abs_diff_eq!(column.mean().unwrap(), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(column.std(1.0), 1.0, epsilon = 1e-12);
        }
        // Constant column stays at zero instead of becoming NaN.
        assert!(values.column(2).iter().all(|&x| x == 0.0));
        assert_eq!(params.zero_variance_dimensions(), &[2]);
    }

    #[test]
    fn test_large_magnitude_column_is_not_constant() {
        let data = matrix(array![[1e6, 0.0], [1e6 + 1.0, 1.0], [1e6 + 2.0, 2.0]]);
        let params = Standardizer::fit(&data).unwrap();
        assert!(params.zero_variance_dimensions().is_empty());
        assert_abs_diff_eq!(params.std_devs()[0], 1.0, epsilon = 1e-9);

        let scaled = params.transform_matrix(&data).unwrap();
        let col = scaled.values().column(0).to_owned();
        assert_abs_diff_eq!(col, array![-1.0, 0.0, 1.0], epsilon = 1e-9);
        assert_abs_diff_eq!(col.std(1.0), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_repeated_inexact_value_is_constant() {
        let data = matrix(array![[0.1, 1.0], [0.1, 2.0], [0.1, 4.0]]);
        let params = Standardizer::fit(&data).unwrap();
        assert_eq!(params.zero_variance_dimensions(), &[0]);
        let scaled = params.transform_matrix(&data).unwrap();
        assert!(scaled.values().column(0).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_sample_standard_deviation() {
        let m = matrix(array![[1.0], [3.0]]);
        let params = Standardizer::fit(&m).unwrap();
        assert_abs_diff_eq!(params.means()[0], 2.0);
        // sqrt(((1-2)^2 + (3-2)^2) / (2 - 1))
        assert_abs_diff_eq!(params.std_devs()[0], 2f64.sqrt(), epsilon = 1e-15);
    }

    #[test]
    fn test_transform_out_of_sample_vector() {
        let m = matrix(array![[0.0, 1.0], [2.0, 1.0], [4.0, 1.0]]);
        let params = Standardizer::fit(&m).unwrap();
        let out = params.transform(array![6.0, 9.0].view()).unwrap();
        assert_abs_diff_eq!(out[0], 2.0, epsilon = 1e-12);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn test_transform_rejects_wrong_length() {
        let m = matrix(array![[0.0, 1.0], [2.0, 3.0]]);
        let params = Standardizer::fit(&m).unwrap();
        assert!(matches!(
            params.transform(array![1.0].view()),
            Err(EvalError::VectorLength {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn test_fit_requires_two_rows() {
        let m = matrix(array![[1.0, 2.0]]);
        assert!(matches!(
            Standardizer::fit(&m),
            Err(EvalError::InsufficientSamples { .. })
        ));
    }

    #[test]
    fn test_fit_rejects_nan() {
        let m = matrix(array![[1.0, f64::NAN], [2.0, 3.0]]);
        assert!(matches!(
            Standardizer::fit(&m),
            Err(EvalError::NonFiniteInput { row: 0, col: 1 })
        ));
    }
}
