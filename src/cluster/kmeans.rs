//! K-means through `linfa-clustering`, seeded from the pipeline seed.

use super::{argmax, linfa_rng, ClusterPredictor};
use crate::error::{EvalError, Result};
use crate::features::FeatureMatrix;
use crate::DEFAULT_SEED;
use linfa::traits::Fit;
use linfa::DatasetBase;
use linfa_clustering::KMeans as LinfaKMeans;
use log::info;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

#[derive(Debug, Clone)]
pub struct KMeans {
    k: usize,
    max_iter: usize,
    tol: f64,
    n_runs: usize,
    seed: u64,
}

impl KMeans {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            max_iter: 20,
            tol: 1e-4,
            n_runs: 10,
            seed: DEFAULT_SEED,
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

    /// Independent k-means++ restarts; the lowest-inertia run is kept.
    pub fn with_runs(mut self, n_runs: usize) -> Self {
        self.n_runs = n_runs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn fit(&self, data: ArrayView2<'_, f64>) -> Result<KMeansModel> {
        let n = data.nrows();
        if n == 0 || data.ncols() == 0 {
            return Err(EvalError::EmptyInput {
                context: "K-means input has no rows or no columns",
            });
        }
        if self.k == 0 || self.k > n {
            return Err(EvalError::InvalidClusterCount {
                requested: self.k,
                rows: n,
            });
        }
        FeatureMatrix::check_finite(data)?;

        let dataset = DatasetBase::from(data.to_owned());
        let model = LinfaKMeans::params_with_rng(self.k, linfa_rng(self.seed))
            .max_n_iterations(self.max_iter as u64)
            .tolerance(self.tol)
            .n_runs(self.n_runs.max(1))
            .fit(&dataset)
            .map_err(|e| EvalError::Clustering {
                method: "kmeans",
                reason: e.to_string(),
            })?;

        info!(
            "K-means fitted: k={}, {} rows, seed {}.",
            self.k, n, self.seed
        );
        Ok(KMeansModel {
            centroids: model.centroids().to_owned(),
        })
    }
}

/// Fitted centroids, one per row.
#[derive(Debug, Clone)]
pub struct KMeansModel {
    centroids: Array2<f64>,
}

impl KMeansModel {
    pub fn centroids(&self) -> &Array2<f64> {
        &self.centroids
    }
}

impl ClusterPredictor for KMeansModel {
    /// Nearest centroid; equidistant centroids resolve to the lowest ID.
    fn predict(&self, vector: ArrayView1<'_, f64>) -> usize {
        argmax(
            self.centroids
                .axis_iter(Axis(0))
                .map(|centroid| -squared_distance(vector, centroid)),
        )
    }

    fn num_clusters(&self) -> usize {
        self.centroids.nrows()
    }
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}
