//! Gaussian mixture through `linfa-clustering`.
//!
//! EM starts from a K-means initialisation drawn from the same seeded RNG and
//! stops after `max_iter` rounds or once the lower bound improves by less than
//! `tol`.

use super::{linfa_rng, ClusterPredictor};
use crate::error::{EvalError, Result};
use crate::features::FeatureMatrix;
use crate::DEFAULT_SEED;
use linfa::traits::{Fit, Predict};
use linfa::DatasetBase;
use linfa_clustering::GaussianMixtureModel as LinfaGmm;
use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

#[derive(Debug, Clone)]
pub struct GaussianMixture {
    n_components: usize,
    max_iter: usize,
    tol: f64,
    seed: u64,
    /// Added to the covariance diagonal so small components cannot collapse.
    reg_covar: f64,
}

impl GaussianMixture {
    pub fn new(n_components: usize) -> Self {
        Self {
            n_components,
            max_iter: 20,
            tol: 1e-3,
            seed: DEFAULT_SEED,
            reg_covar: 1e-6,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_reg_covar(mut self, reg_covar: f64) -> Self {
        self.reg_covar = reg_covar;
        self
    }

    pub fn fit(&self, data: ArrayView2<'_, f64>) -> Result<GaussianMixtureModel> {
        let (n, d) = data.dim();
        if n == 0 || d == 0 {
            return Err(EvalError::EmptyInput {
                context: "Gaussian mixture input has no rows or no columns",
            });
        }
        if self.n_components == 0 || self.n_components > n {
            return Err(EvalError::InvalidClusterCount {
                requested: self.n_components,
                rows: n,
            });
        }
        if !(self.reg_covar > 0.0) {
            return Err(EvalError::InvalidParameter {
                name: "reg_covar",
                reason: format!("must be positive, got {}", self.reg_covar),
            });
        }
        FeatureMatrix::check_finite(data)?;

        let dataset = DatasetBase::from(data.to_owned());
        let model = LinfaGmm::params(self.n_components)
            .max_n_iterations(self.max_iter as u64)
            .tolerance(self.tol)
            .reg_covariance(self.reg_covar)
            .with_rng(linfa_rng(self.seed))
            .fit(&dataset)
            .map_err(|e| EvalError::Clustering {
                method: "gmm",
                reason: e.to_string(),
            })?;

        info!(
            "Gaussian mixture fitted: k={}, {} rows, weights {:?}",
            self.n_components,
            n,
            model
                .weights()
                .iter()
                .map(|w| format!("{w:.3}"))
                .collect::<Vec<_>>()
        );
        Ok(GaussianMixtureModel { model })
    }
}

#[derive(Debug, Clone)]
pub struct GaussianMixtureModel {
    model: LinfaGmm<f64>,
}

impl GaussianMixtureModel {
    pub fn weights(&self) -> &Array1<f64> {
        self.model.weights()
    }

    pub fn means(&self) -> &Array2<f64> {
        self.model.means()
    }
}

impl ClusterPredictor for GaussianMixtureModel {
    fn predict(&self, vector: ArrayView1<'_, f64>) -> usize {
        let row = vector.insert_axis(Axis(0));
        let labels: Array1<usize> = self.model.predict(&row);
        labels.get(0).copied().unwrap_or(0)
    }

    fn num_clusters(&self) -> usize {
        self.model.weights().len()
    }
}
