use crate::error::{EvalError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::collections::HashMap;
use std::fmt;

/// Identifies a patient across feature vectors, labels and cluster assignments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatientId(pub String);

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PatientId {
    fn from(s: &str) -> Self {
        PatientId(s.to_string())
    }
}

impl From<String> for PatientId {
    fn from(s: String) -> Self {
        PatientId(s)
    }
}

/// N patients by D features. Row `i` always belongs to `patient_ids[i]`;
/// every transform that produces a new matrix keeps that association.
#[derive(Clone, Debug)]
pub struct FeatureMatrix {
    patient_ids: Vec<PatientId>,
    values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn new(patient_ids: Vec<PatientId>, values: Array2<f64>) -> Result<Self> {
        if patient_ids.len() != values.nrows() {
            return Err(EvalError::InvalidParameter {
                name: "patient_ids",
                reason: format!(
                    "{} patient IDs supplied for a matrix with {} rows",
                    patient_ids.len(),
                    values.nrows()
                ),
            });
        }
        Ok(Self {
            patient_ids,
            values,
        })
    }

    /// Builds the matrix from the feature-construction output. Rows are
    /// ordered by patient ID so repeated runs see identical matrices.
    pub fn from_map(raw_features: &HashMap<PatientId, Vec<f64>>) -> Result<Self> {
        if raw_features.is_empty() {
            return Err(EvalError::EmptyInput {
                context: "no patients in the raw feature map",
            });
        }
        let mut patient_ids: Vec<PatientId> = raw_features.keys().cloned().collect();
        patient_ids.sort_unstable();

        let num_features = raw_features[&patient_ids[0]].len();
        if num_features == 0 {
            return Err(EvalError::EmptyInput {
                context: "feature vectors have zero dimensions",
            });
        }

        let mut flat = Vec::with_capacity(patient_ids.len() * num_features);
        for patient in &patient_ids {
            let row = &raw_features[patient];
            if row.len() != num_features {
                return Err(EvalError::DimensionMismatch {
                    patient: patient.0.clone(),
                    expected: num_features,
                    found: row.len(),
                });
            }
            flat.extend_from_slice(row);
        }
        let values = Array2::from_shape_vec((patient_ids.len(), num_features), flat)?;
        Self::new(patient_ids, values)
    }

    pub fn patient_ids(&self) -> &[PatientId] {
        &self.patient_ids
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    /// Same patients, new values (e.g. after scaling or projection).
    pub fn with_values(&self, values: Array2<f64>) -> Result<Self> {
        Self::new(self.patient_ids.clone(), values)
    }

    /// Applies `f` to every row in parallel, keeping row order.
    pub fn map_rows<F>(&self, out_dim: usize, f: F) -> Result<Self>
    where
        F: Fn(ArrayView1<'_, f64>) -> Result<Array1<f64>> + Sync,
    {
        use rayon::prelude::*;
        let rows: Vec<Array1<f64>> = self
            .values
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| f(row))
            .collect::<Result<_>>()?;
        let mut out = Array2::<f64>::zeros((rows.len(), out_dim));
        for (mut dst, src) in out.axis_iter_mut(Axis(0)).zip(rows.iter()) {
            dst.assign(src);
        }
        self.with_values(out)
    }

    pub(crate) fn check_finite(values: ArrayView2<'_, f64>) -> Result<()> {
        if let Some(((row, col), _)) = values.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(EvalError::NonFiniteInput { row, col });
        }
        Ok(())
    }
}

/// Number of rows per partition when `num_rows` rows are split `partitions` ways.
pub(crate) fn partition_size(num_rows: usize, partitions: usize) -> usize {
    let partitions = partitions.max(1);
    num_rows.div_ceil(partitions).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_from_map_orders_rows_by_patient() {
        let mut raw = HashMap::new();
        raw.insert(PatientId::from("p2"), vec![2.0, 20.0]);
        raw.insert(PatientId::from("p1"), vec![1.0, 10.0]);
        raw.insert(PatientId::from("p3"), vec![3.0, 30.0]);

        let matrix = FeatureMatrix::from_map(&raw).unwrap();
        assert_eq!(
            matrix.patient_ids(),
            &[
                PatientId::from("p1"),
                PatientId::from("p2"),
                PatientId::from("p3")
            ]
        );
        assert_eq!(matrix.values(), array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0]]);
    }

    #[test]
    fn test_from_map_rejects_ragged_vectors() {
        let mut raw = HashMap::new();
        raw.insert(PatientId::from("a"), vec![1.0, 2.0]);
        raw.insert(PatientId::from("b"), vec![1.0]);
        let err = FeatureMatrix::from_map(&raw).unwrap_err();
        assert!(matches!(
            err,
            EvalError::DimensionMismatch {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_from_map_rejects_empty() {
        let raw: HashMap<PatientId, Vec<f64>> = HashMap::new();
        assert!(matches!(
            FeatureMatrix::from_map(&raw),
            Err(EvalError::EmptyInput { .. })
        ));
    }

    #[test]
    fn test_map_rows_keeps_patient_order() {
        let ids = vec![PatientId::from("x"), PatientId::from("y")];
        let matrix = FeatureMatrix::new(ids.clone(), array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let summed = matrix
            .map_rows(1, |row| Ok(Array1::from_elem(1, row.sum())))
            .unwrap();
        assert_eq!(summed.patient_ids(), ids.as_slice());
        assert_eq!(summed.values(), array![[3.0], [7.0]]);
    }

    #[test]
    fn test_partition_size() {
        assert_eq!(partition_size(10, 3), 4);
        assert_eq!(partition_size(10, 0), 10);
        assert_eq!(partition_size(2, 8), 1);
        assert_eq!(partition_size(0, 4), 1);
    }
}
