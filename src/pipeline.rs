//! End-to-end evaluation: raw features → standardize → PCA → {K-means, GMM,
//! NMF} → cluster assignments → purity against the phenotype labels.

use crate::assign::{assign_from_nmf, assign_from_predictor, ClusterAssignment};
use crate::cluster::{GaussianMixture, KMeans};
use crate::error::Result;
use crate::features::{FeatureMatrix, PatientId};
use crate::nmf::{NmfConfig, NmfEngine, NmfFactors, NonNegativePolicy, DEFAULT_PARTITIONS};
use crate::phenotype::PhenotypeClass;
use crate::purity::{composition, join_labels, purity, ClusterComposition};
use crate::reduce::{ProjectionBasis, Reducer};
use crate::standardize::{ScalingParameters, Standardizer};
use crate::DEFAULT_SEED;
use log::info;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Which representation of the population is factorized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmfInput {
    /// The PCA projection shared with K-means and GMM.
    Reduced,
    /// Standardized features before projection.
    Standardized,
    /// Raw features as delivered by feature construction.
    Raw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strategy {
    KMeans,
    GaussianMixture,
    Nmf,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::KMeans, Strategy::GaussianMixture, Strategy::Nmf];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::KMeans => "kmeans",
            Strategy::GaussianMixture => "gmm",
            Strategy::Nmf => "nmf",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub pca_components: usize,
    /// K for K-means and GMM, and the NMF rank.
    pub clusters: usize,
    pub kmeans_iterations: usize,
    pub gmm_iterations: usize,
    pub nmf_iterations: usize,
    pub nmf_tolerance: Option<f64>,
    pub nmf_input: NmfInput,
    pub non_negative: NonNegativePolicy,
    pub partitions: usize,
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pca_components: 10,
            clusters: 5,
            kmeans_iterations: 20,
            gmm_iterations: 20,
            nmf_iterations: 200,
            nmf_tolerance: None,
            nmf_input: NmfInput::Reduced,
            non_negative: NonNegativePolicy::Absolute,
            partitions: DEFAULT_PARTITIONS,
            seed: DEFAULT_SEED,
        }
    }
}

impl PipelineConfig {
    pub fn nmf_config(&self) -> NmfConfig {
        NmfConfig {
            rank: self.clusters,
            max_iterations: self.nmf_iterations,
            seed: self.seed,
            partitions: self.partitions,
            tolerance: self.nmf_tolerance,
            ..NmfConfig::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct StrategyResult {
    pub strategy: Strategy,
    pub purity: f64,
    pub assignments: Vec<ClusterAssignment>,
    pub composition: Vec<ClusterComposition<PhenotypeClass>>,
    /// Patients scored (present in both assignments and labels).
    pub joined: usize,
    pub missing_label: usize,
    pub missing_assignment: usize,
}

#[derive(Clone, Debug)]
pub struct EvaluationReport {
    pub scaling: ScalingParameters,
    pub basis: ProjectionBasis,
    pub nmf: NmfFactors,
    pub strategies: Vec<StrategyResult>,
}

impl EvaluationReport {
    pub fn result(&self, strategy: Strategy) -> Option<&StrategyResult> {
        self.strategies.iter().find(|r| r.strategy == strategy)
    }

    pub fn purity(&self, strategy: Strategy) -> Option<f64> {
        self.result(strategy).map(|r| r.purity)
    }
}

pub fn evaluate(
    raw_features: &HashMap<PatientId, Vec<f64>>,
    labels: &HashMap<PatientId, PhenotypeClass>,
    config: &PipelineConfig,
) -> Result<EvaluationReport> {
    evaluate_observed(raw_features, labels, config, |_, _| {})
}

/// [`evaluate`] with an NMF iteration observer, see [`NmfEngine::run_observed`].
pub fn evaluate_observed<F>(
    raw_features: &HashMap<PatientId, Vec<f64>>,
    labels: &HashMap<PatientId, PhenotypeClass>,
    config: &PipelineConfig,
    nmf_observer: F,
) -> Result<EvaluationReport>
where
    F: FnMut(usize, f64),
{
    let start = Instant::now();
    let raw = FeatureMatrix::from_map(raw_features)?;
    info!(
        "Evaluating {} patients x {} features against {} labels.",
        raw.nrows(),
        raw.ncols(),
        labels.len()
    );

    let scaling = Standardizer::fit(&raw)?;
    let standardized = scaling.transform_matrix(&raw)?;
    let basis = Reducer::fit(&standardized, config.pca_components)?;
    let reduced = basis.project_matrix(&standardized)?;

    let kmeans = KMeans::new(config.clusters)
        .with_max_iter(config.kmeans_iterations)
        .with_seed(config.seed)
        .fit(reduced.values())?;
    let kmeans_assignments = assign_from_predictor(&reduced, &kmeans);

    let gmm = GaussianMixture::new(config.clusters)
        .with_max_iter(config.gmm_iterations)
        .with_seed(config.seed)
        .fit(reduced.values())?;
    let gmm_assignments = assign_from_predictor(&reduced, &gmm);

    let nmf_source = match config.nmf_input {
        NmfInput::Reduced => &reduced,
        NmfInput::Standardized => &standardized,
        NmfInput::Raw => &raw,
    };
    info!(
        "NMF input: {:?} matrix, non-negativity policy {:?}.",
        config.nmf_input, config.non_negative
    );
    let nmf_matrix = config.non_negative.apply(nmf_source)?;
    let factors =
        NmfEngine::new(config.nmf_config()).run_observed(nmf_matrix.values(), nmf_observer)?;
    let nmf_assignments = assign_from_nmf(nmf_matrix.patient_ids(), factors.w())?;

    let strategies = [
        (Strategy::KMeans, kmeans_assignments),
        (Strategy::GaussianMixture, gmm_assignments),
        (Strategy::Nmf, nmf_assignments),
    ]
    .into_iter()
    .map(|(strategy, assignments)| score(strategy, assignments, labels))
    .collect::<Result<Vec<_>>>()?;

    info!("Evaluation finished in {:.2?}.", start.elapsed());
    Ok(EvaluationReport {
        scaling,
        basis,
        nmf: factors,
        strategies,
    })
}

fn score(
    strategy: Strategy,
    assignments: Vec<ClusterAssignment>,
    labels: &HashMap<PatientId, PhenotypeClass>,
) -> Result<StrategyResult> {
    let joined = join_labels(&assignments, labels);
    let value = purity(&joined.pairs)?;
    info!(
        "{} purity: {:.5} over {} patients.",
        strategy,
        value,
        joined.pairs.len()
    );
    Ok(StrategyResult {
        strategy,
        purity: value,
        composition: composition(&joined.pairs),
        joined: joined.pairs.len(),
        missing_label: joined.missing_label,
        missing_assignment: joined.missing_assignment,
        assignments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalError;

    fn tiny_population() -> (HashMap<PatientId, Vec<f64>>, HashMap<PatientId, PhenotypeClass>) {
        let rows = [
            ("a", [0.0, 0.1, 5.0], PhenotypeClass::Case),
            ("b", [0.2, 0.0, 5.1], PhenotypeClass::Case),
            ("c", [0.1, 0.2, 4.9], PhenotypeClass::Case),
            ("d", [5.0, 5.1, 0.0], PhenotypeClass::Control),
            ("e", [5.2, 4.9, 0.1], PhenotypeClass::Control),
            ("f", [4.9, 5.0, 0.2], PhenotypeClass::Control),
        ];
        let mut features = HashMap::new();
        let mut labels = HashMap::new();
        for (id, f, class) in rows {
            features.insert(PatientId::from(id), f.to_vec());
            labels.insert(PatientId::from(id), class);
        }
        (features, labels)
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            pca_components: 2,
            clusters: 2,
            nmf_iterations: 100,
            partitions: 2,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_default_config_uses_fixed_seed_and_partitions() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.seed, DEFAULT_SEED);
        assert_eq!(cfg.partitions, DEFAULT_PARTITIONS);
        assert_eq!(cfg.nmf_config().partitions, DEFAULT_PARTITIONS);
        assert_eq!(cfg.nmf_config().rank, cfg.clusters);
    }

    #[test]
    fn test_all_strategies_scored() {
        let (features, labels) = tiny_population();
        let report = evaluate(&features, &labels, &config()).unwrap();
        assert_eq!(report.strategies.len(), 3);
        for strategy in Strategy::ALL {
            let result = report.result(strategy).unwrap();
            assert_eq!(result.assignments.len(), 6);
            assert_eq!(result.joined, 6);
            assert!((0.5..=1.0).contains(&result.purity));
        }
        assert_eq!(report.basis.num_components(), 2);
        assert_eq!(report.nmf.w().shape(), &[6, 2]);
    }

    #[test]
    fn test_kmeans_recovers_two_groups() {
        let (features, labels) = tiny_population();
        let report = evaluate(&features, &labels, &config()).unwrap();
        assert_eq!(report.purity(Strategy::KMeans), Some(1.0));
    }

    #[test]
    fn test_unlabelled_patients_are_excluded() {
        let (mut features, labels) = tiny_population();
        features.insert(PatientId::from("g"), vec![2.5, 2.5, 2.5]);
        let report = evaluate(&features, &labels, &config()).unwrap();
        let nmf = report.result(Strategy::Nmf).unwrap();
        assert_eq!(nmf.assignments.len(), 7);
        assert_eq!(nmf.joined, 6);
        assert_eq!(nmf.missing_label, 1);
    }

    #[test]
    fn test_no_overlap_is_an_error() {
        let (features, _) = tiny_population();
        let mut labels = HashMap::new();
        labels.insert(PatientId::from("nobody"), PhenotypeClass::Case);
        assert!(matches!(
            evaluate(&features, &labels, &config()),
            Err(EvalError::EmptyEvaluation)
        ));
    }

    #[test]
    fn test_reject_policy_fails_on_signed_pca_output() {
        let (features, labels) = tiny_population();
        let cfg = PipelineConfig {
            non_negative: NonNegativePolicy::Reject,
            ..config()
        };
        assert!(matches!(
            evaluate(&features, &labels, &cfg),
            Err(EvalError::NegativeEntry { .. })
        ));
    }

    #[test]
    fn test_raw_input_with_reject_policy_is_accepted() {
        let (features, labels) = tiny_population();
        let cfg = PipelineConfig {
            nmf_input: NmfInput::Raw,
            non_negative: NonNegativePolicy::Reject,
            ..config()
        };
        let report = evaluate(&features, &labels, &cfg).unwrap();
        assert_eq!(report.nmf.h().shape(), &[2, 3]);
        assert!(report.nmf.w().iter().all(|&x| x >= 0.0));
        let nmf = report.purity(Strategy::Nmf).unwrap();
        assert!((0.5..=1.0).contains(&nmf));
    }
}
