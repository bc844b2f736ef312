//! Phenotype-cluster agreement: standardize patient feature vectors, reduce
//! them with PCA, cluster them three ways (K-means, Gaussian mixture, NMF), and
//! score every clustering by its purity against rule-based phenotype labels.

pub mod assign;
pub mod cluster;
pub mod error;
pub mod features;
pub mod nmf;
pub mod phenotype;
pub mod pipeline;
pub mod purity;
pub mod reduce;
pub mod standardize;

/// Seed shared by every stochastic step: NMF initialisation, K-means seeding
/// and the Gaussian mixture's initialisation.
pub const DEFAULT_SEED: u64 = 8803;

pub use error::{EvalError, Result};
pub use features::{FeatureMatrix, PatientId};
pub use phenotype::PhenotypeClass;
pub use pipeline::{evaluate, evaluate_observed, EvaluationReport, PipelineConfig, Strategy};
