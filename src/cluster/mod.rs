//! K-means and Gaussian-mixture collaborators backed by `linfa-clustering`.
//!
//! Both models are fitted on the PCA-reduced feature matrix and then used only
//! through [`ClusterPredictor`]: one vector in, one cluster ID out. The
//! assigner and purity evaluator never look inside them.

mod gmm;
mod kmeans;

pub use gmm::{GaussianMixture, GaussianMixtureModel};
pub use kmeans::{KMeans, KMeansModel};

use ndarray::ArrayView1;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;

/// A fitted model that maps a feature vector to a cluster ID.
pub trait ClusterPredictor: Sync {
    /// Returns the cluster for `vector`. Ties go to the lowest cluster ID.
    fn predict(&self, vector: ArrayView1<'_, f64>) -> usize;

    fn num_clusters(&self) -> usize;
}

/// The RNG family linfa uses internally, seeded from the pipeline seed.
pub(crate) fn linfa_rng(seed: u64) -> Xoshiro256Plus {
    Xoshiro256Plus::seed_from_u64(seed)
}

/// Index of the largest value; the first one wins on ties. NaN never wins.
pub(crate) fn argmax<I>(values: I) -> usize
where
    I: IntoIterator<Item = f64>,
{
    let mut best_idx = 0;
    let mut best_val = f64::NEG_INFINITY;
    for (idx, value) in values.into_iter().enumerate() {
        if value > best_val {
            best_idx = idx;
            best_val = value;
        }
    }
    best_idx
}

#[cfg(test)]
mod tests {
    use super::argmax;

    #[test]
    fn test_argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax([0.2, 0.7, 0.7, 0.1]), 1);
        assert_eq!(argmax([1.0, 1.0]), 0);
        assert_eq!(argmax([f64::NAN, 0.5]), 1);
        assert_eq!(argmax(Vec::<f64>::new()), 0);
    }
}
