//! Turns every clustering strategy's output into `(patient, cluster)` pairs.

use crate::cluster::{argmax, ClusterPredictor};
use crate::error::{EvalError, Result};
use crate::features::{FeatureMatrix, PatientId};
use ndarray::{Array2, Axis};
use rayon::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterAssignment {
    pub patient_id: PatientId,
    pub cluster: usize,
}

/// Hard assignment from NMF memberships: each patient goes to the factor with
/// the largest weight in its row of W, lowest factor index on ties.
pub fn assign_from_nmf(patient_ids: &[PatientId], w: &Array2<f64>) -> Result<Vec<ClusterAssignment>> {
    if patient_ids.len() != w.nrows() {
        return Err(EvalError::InvalidParameter {
            name: "w",
            reason: format!(
                "W has {} rows but {} patient IDs were supplied",
                w.nrows(),
                patient_ids.len()
            ),
        });
    }
    let clusters: Vec<usize> = w
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| argmax(row.iter().copied()))
        .collect();
    from_predictions(patient_ids, &clusters)
}

/// Runs a fitted model's `predict` over every row of `matrix`.
pub fn assign_from_predictor<P>(matrix: &FeatureMatrix, predictor: &P) -> Vec<ClusterAssignment>
where
    P: ClusterPredictor + ?Sized,
{
    let clusters: Vec<usize> = matrix
        .values()
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| predictor.predict(row))
        .collect();
    matrix
        .patient_ids()
        .iter()
        .zip(clusters)
        .map(|(patient_id, cluster)| ClusterAssignment {
            patient_id: patient_id.clone(),
            cluster,
        })
        .collect()
}

/// Pairs externally computed cluster IDs with the patients they were computed for.
pub fn from_predictions(patient_ids: &[PatientId], clusters: &[usize]) -> Result<Vec<ClusterAssignment>> {
    if patient_ids.len() != clusters.len() {
        return Err(EvalError::InvalidParameter {
            name: "clusters",
            reason: format!(
                "{} predictions for {} patients",
                clusters.len(),
                patient_ids.len()
            ),
        });
    }
    Ok(patient_ids
        .iter()
        .zip(clusters)
        .map(|(patient_id, &cluster)| ClusterAssignment {
            patient_id: patient_id.clone(),
            cluster,
        })
        .collect())
}
