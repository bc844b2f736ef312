//! Row-partitioned non-negative matrix factorization.
//!
//! `V (N x D') ≈ W (N x r) · H (r x D')` by Lee-Seung multiplicative updates on
//! the squared Frobenius error:
//!
//! ```text
//! H ← H ⊙ (Wᵀ V) ⊘ (Wᵀ W H + ε)
//! W ← W ⊙ (V Hᵀ) ⊘ (W H Hᵀ + ε)
//! ```
//!
//! V and W are split into the same row partitions. Each iteration has two
//! barriers:
//!
//! 1. every partition emits its partial `(W_pᵀ V_p, W_pᵀ W_p)`; the partials are
//!    summed in partition order and H is replaced by a new matrix;
//! 2. the new H (and `H Hᵀ`) is shared read-only with every partition, and each
//!    partition returns a new block of W.
//!
//! Partials are collected before they are combined, so the floating-point
//! summation order never depends on thread scheduling and a fixed seed gives
//! identical factors on every run.

use crate::error::{EvalError, Result};
use crate::features::{partition_size, FeatureMatrix};
use crate::DEFAULT_SEED;
use log::{debug, info};
use ndarray::{concatenate, Array2, ArrayView2, Axis, Zip};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Uniform};
use rayon::prelude::*;

/// Row partitions used when the caller does not choose. A fixed count keeps
/// the reduction order, and so the factors, identical on every host.
pub const DEFAULT_PARTITIONS: usize = 8;

const INIT_LOW: f64 = 1e-3;
const INIT_HIGH: f64 = 1.0;

#[derive(Clone, Debug)]
pub struct NmfConfig {
    pub rank: usize,
    pub max_iterations: usize,
    pub seed: u64,
    /// Added to every update denominator.
    pub epsilon: f64,
    /// Number of row partitions; the reductions run one task per partition.
    pub partitions: usize,
    /// Stop once the relative objective improvement of an iteration drops
    /// below this value. `None` always runs `max_iterations` rounds.
    pub tolerance: Option<f64>,
}

impl Default for NmfConfig {
    fn default() -> Self {
        Self {
            rank: 5,
            max_iterations: 200,
            seed: DEFAULT_SEED,
            epsilon: 1e-12,
            partitions: DEFAULT_PARTITIONS,
            tolerance: None,
        }
    }
}

/// How a possibly-signed matrix is made acceptable to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonNegativePolicy {
    /// Fail on the first negative entry.
    Reject,
    /// Replace negative entries with 0.
    Clamp,
    /// Replace every entry with its absolute value.
    Absolute,
}

impl NonNegativePolicy {
    pub fn apply(self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        FeatureMatrix::check_finite(matrix.values())?;
        match self {
            NonNegativePolicy::Reject => {
                check_non_negative(matrix.values())?;
                Ok(matrix.clone())
            }
            NonNegativePolicy::Clamp => matrix.with_values(matrix.values().mapv(|x| x.max(0.0))),
            NonNegativePolicy::Absolute => matrix.with_values(matrix.values().mapv(f64::abs)),
        }
    }
}

/// The two factors plus the objective trajectory of the run that produced them.
#[derive(Clone, Debug)]
pub struct NmfFactors {
    w: Array2<f64>,
    h: Array2<f64>,
    objective_history: Vec<f64>,
}

impl NmfFactors {
    /// N x r patient memberships.
    pub fn w(&self) -> &Array2<f64> {
        &self.w
    }

    /// r x D' factor loadings.
    pub fn h(&self) -> &Array2<f64> {
        &self.h
    }

    /// `‖V − WH‖²` after initialization, then after each completed iteration.
    pub fn objective_history(&self) -> &[f64] {
        &self.objective_history
    }

    pub fn iterations(&self) -> usize {
        self.objective_history.len().saturating_sub(1)
    }

    pub fn reconstruction_error(&self) -> f64 {
        self.objective_history.last().copied().unwrap_or(f64::NAN)
    }

    pub fn into_parts(self) -> (Array2<f64>, Array2<f64>) {
        (self.w, self.h)
    }
}

pub struct NmfEngine {
    config: NmfConfig,
}

impl NmfEngine {
    pub fn new(config: NmfConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NmfConfig {
        &self.config
    }

    pub fn run(&self, v: ArrayView2<'_, f64>) -> Result<NmfFactors> {
        self.run_observed(v, |_, _| {})
    }

    /// Same as [`run`](Self::run), calling `observer(iteration, objective)` after
    /// every completed iteration.
    pub fn run_observed<F>(&self, v: ArrayView2<'_, f64>, mut observer: F) -> Result<NmfFactors>
    where
        F: FnMut(usize, f64),
    {
        let cfg = &self.config;
        let (num_rows, num_cols) = v.dim();
        if num_rows == 0 || num_cols == 0 {
            return Err(EvalError::EmptyInput {
                context: "NMF input matrix has no rows or no columns",
            });
        }
        if cfg.rank == 0 {
            return Err(EvalError::InvalidRank { rank: cfg.rank });
        }
        if !(cfg.epsilon > 0.0 && cfg.epsilon.is_finite()) {
            return Err(EvalError::InvalidParameter {
                name: "epsilon",
                reason: format!("must be a positive finite number, got {}", cfg.epsilon),
            });
        }
        FeatureMatrix::check_finite(v)?;
        check_non_negative(v)?;

        let rank = cfg.rank;
        let eps = cfg.epsilon;
        let chunk_rows = partition_size(num_rows, cfg.partitions);
        let v_parts: Vec<ArrayView2<'_, f64>> = v.axis_chunks_iter(Axis(0), chunk_rows).collect();
        info!(
            "Running NMF: {}x{} matrix, rank={}, iterations={}, seed={}, partitions={}",
            num_rows,
            num_cols,
            rank,
            cfg.max_iterations,
            cfg.seed,
            v_parts.len()
        );

        let (w_init, mut h) = initial_factors(num_rows, num_cols, rank, cfg.seed)?;
        let mut w_blocks: Vec<Array2<f64>> = w_init
            .axis_chunks_iter(Axis(0), chunk_rows)
            .map(|block| block.to_owned())
            .collect();

        let mut objective_history = Vec::with_capacity(cfg.max_iterations + 1);
        objective_history.push(objective(&v_parts, &w_blocks, &h));
        debug!("NMF initial objective: {:.6e}", objective_history[0]);

        for iteration in 1..=cfg.max_iterations {
            // Barrier 1: reduce Wᵀ V and Wᵀ W over all partitions.
            let partials: Vec<(Array2<f64>, Array2<f64>)> = v_parts
                .par_iter()
                .zip(w_blocks.par_iter())
                .map(|(v_p, w_p)| (w_p.t().dot(v_p), w_p.t().dot(w_p)))
                .collect();
            let (wt_v, wt_w) = partials.into_iter().fold(
                (Array2::<f64>::zeros((rank, num_cols)), Array2::<f64>::zeros((rank, rank))),
                |(acc_wv, acc_ww), (wv, ww)| (acc_wv + wv, acc_ww + ww),
            );

            let wt_w_h = wt_w.dot(&h);
            let mut h_next = h.clone();
            Zip::from(&mut h_next)
                .and(&wt_v)
                .and(&wt_w_h)
                .for_each(|h_ij, &num, &den| *h_ij *= num / (den + eps));
            if !all_finite(&h_next) {
                return Err(EvalError::NumericInstability {
                    iteration,
                    factor: "H",
                });
            }
            h = h_next;

            // Barrier 2: every partition sees the same new H.
            let h_t = h.t();
            let h_h_t = h.dot(&h_t);
            let w_next: Vec<Array2<f64>> = v_parts
                .par_iter()
                .zip(w_blocks.par_iter())
                .map(|(v_p, w_p)| {
                    let numerator = v_p.dot(&h_t);
                    let denominator = w_p.dot(&h_h_t);
                    let mut block = w_p.clone();
                    Zip::from(&mut block)
                        .and(&numerator)
                        .and(&denominator)
                        .for_each(|w_ik, &num, &den| *w_ik *= num / (den + eps));
                    block
                })
                .collect();
            if !w_next.iter().all(all_finite) {
                return Err(EvalError::NumericInstability {
                    iteration,
                    factor: "W",
                });
            }
            w_blocks = w_next;

            let current = objective(&v_parts, &w_blocks, &h);
            let previous = objective_history[objective_history.len() - 1];
            objective_history.push(current);
            debug!("NMF iteration {}: objective {:.6e}", iteration, current);
            observer(iteration, current);

            if let Some(tol) = cfg.tolerance {
                let improvement = (previous - current) / previous.max(f64::MIN_POSITIVE);
                if improvement < tol {
                    info!(
                        "NMF stopped early at iteration {} (relative improvement {:.3e} < {:.3e}).",
                        iteration, improvement, tol
                    );
                    break;
                }
            }
        }

        let block_views: Vec<ArrayView2<'_, f64>> = w_blocks.iter().map(|b| b.view()).collect();
        let w = concatenate(Axis(0), &block_views)?;
        info!(
            "NMF finished after {} iteration(s), reconstruction error {:.6e}.",
            objective_history.len() - 1,
            objective_history[objective_history.len() - 1]
        );
        Ok(NmfFactors {
            w,
            h,
            objective_history,
        })
    }
}

/// Squared Frobenius norm `‖V − WH‖²`.
pub fn reconstruction_error(v: ArrayView2<'_, f64>, w: &Array2<f64>, h: &Array2<f64>) -> f64 {
    let residual = &v - &w.dot(h);
    residual.iter().map(|x| x * x).sum()
}

fn initial_factors(
    num_rows: usize,
    num_cols: usize,
    rank: usize,
    seed: u64,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let dist = Uniform::new(INIT_LOW, INIT_HIGH).map_err(|e| EvalError::InvalidParameter {
        name: "initialization range",
        reason: e.to_string(),
    })?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let w = Array2::from_shape_fn((num_rows, rank), |_| dist.sample(&mut rng));
    let h = Array2::from_shape_fn((rank, num_cols), |_| dist.sample(&mut rng));
    Ok((w, h))
}

fn objective(v_parts: &[ArrayView2<'_, f64>], w_blocks: &[Array2<f64>], h: &Array2<f64>) -> f64 {
    let partials: Vec<f64> = v_parts
        .par_iter()
        .zip(w_blocks.par_iter())
        .map(|(v_p, w_p)| reconstruction_error(v_p.view(), w_p, h))
        .collect();
    partials.into_iter().sum()
}

fn check_non_negative(v: ArrayView2<'_, f64>) -> Result<()> {
    if let Some(((row, col), &value)) = v.indexed_iter().find(|(_, x)| **x < 0.0) {
        return Err(EvalError::NegativeEntry { row, col, value });
    }
    Ok(())
}

fn all_finite(m: &Array2<f64>) -> bool {
    m.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::PatientId;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn config(rank: usize, iterations: usize) -> NmfConfig {
        NmfConfig {
            rank,
            max_iterations: iterations,
            partitions: 2,
            ..NmfConfig::default()
        }
    }

    fn sample_matrix() -> Array2<f64> {
        array![
            [1.0, 0.5, 0.0, 2.0, 0.1],
            [0.9, 0.4, 0.1, 1.8, 0.0],
            [0.0, 0.1, 3.0, 0.2, 1.5],
            [0.1, 0.0, 2.7, 0.0, 1.4],
            [2.0, 1.0, 0.0, 4.1, 0.2],
            [0.0, 0.2, 6.0, 0.3, 3.1],
            [1.1, 0.6, 1.5, 2.1, 0.8]
        ]
    }

    #[test]
    fn test_shapes_and_non_negativity() {
        let v = sample_matrix();
        for iterations in [0, 1, 5, 40] {
            let factors = NmfEngine::new(config(3, iterations)).run(v.view()).unwrap();
            assert_eq!(factors.w().shape(), &[7, 3]);
            assert_eq!(factors.h().shape(), &[3, 5]);
            assert!(factors.w().iter().all(|&x| x >= 0.0));
            assert!(factors.h().iter().all(|&x| x >= 0.0));
            assert_eq!(factors.iterations(), iterations);
        }
    }

    #[test]
    fn test_factors_stay_non_negative_after_every_round() {
        let mut v = sample_matrix();
        v[[2, 0]] = 0.0;
        v[[6, 4]] = 0.0;
        let full = NmfEngine::new(config(3, 30)).run(v.view()).unwrap();
        for rounds in 0..=30 {
            let factors = NmfEngine::new(config(3, rounds)).run(v.view()).unwrap();
            assert!(factors.w().iter().all(|&x| x.is_finite() && x >= 0.0), "W after {rounds}");
            assert!(factors.h().iter().all(|&x| x.is_finite() && x >= 0.0), "H after {rounds}");
            // A shorter run is a prefix of the longer one.
            assert_eq!(
                factors.objective_history(),
                &full.objective_history()[..=rounds]
            );
        }
    }

    #[test]
    fn test_default_config_is_host_independent() {
        let cfg = NmfConfig::default();
        assert_eq!(cfg.partitions, DEFAULT_PARTITIONS);
        assert_eq!(cfg.seed, DEFAULT_SEED);
        assert_eq!(cfg.max_iterations, 200);
    }

    #[test]
    fn test_zero_iterations_returns_initialization() {
        let v = sample_matrix();
        let factors = NmfEngine::new(config(2, 0)).run(v.view()).unwrap();
        let (w0, h0) = initial_factors(7, 5, 2, DEFAULT_SEED).unwrap();
        assert_eq!(factors.w(), &w0);
        assert_eq!(factors.h(), &h0);
        assert!(w0.iter().all(|&x| (INIT_LOW..INIT_HIGH).contains(&x)));
        assert_eq!(factors.objective_history().len(), 1);
    }

    #[test]
    fn test_objective_is_non_increasing() {
        let v = sample_matrix();
        let factors = NmfEngine::new(config(2, 100)).run(v.view()).unwrap();
        for pair in factors.objective_history().windows(2) {
            assert!(
                pair[1] <= pair[0] * (1.0 + 1e-9) + 1e-12,
                "objective increased: {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_history_matches_direct_reconstruction_error() {
        let v = sample_matrix();
        let factors = NmfEngine::new(config(2, 10)).run(v.view()).unwrap();
        let direct = reconstruction_error(v.view(), factors.w(), factors.h());
        assert_abs_diff_eq!(factors.reconstruction_error(), direct, epsilon = 1e-9);
    }

    #[test]
    fn test_rank_one_example_beats_zero_baseline() {
        let v = array![[1.0, 1.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0]];
        let factors = NmfEngine::new(config(1, 50)).run(v.view()).unwrap();
        let zero_baseline: f64 = v.iter().map(|x| x * x).sum();
        assert_abs_diff_eq!(zero_baseline, 54.0);
        assert!(factors.reconstruction_error() < zero_baseline);
        assert!(factors.reconstruction_error() < factors.objective_history()[0]);
        // The best rank-1 fit leaves only the [1,0]/[0,1] asymmetry unexplained.
        assert!(factors.reconstruction_error() < 1.5);
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let v = sample_matrix();
        let a = NmfEngine::new(config(3, 30)).run(v.view()).unwrap();
        let b = NmfEngine::new(config(3, 30)).run(v.view()).unwrap();
        assert_eq!(a.w(), b.w());
        assert_eq!(a.h(), b.h());
    }

    #[test]
    fn test_partition_count_does_not_change_result() {
        let v = sample_matrix();
        let single = NmfEngine::new(NmfConfig {
            partitions: 1,
            ..config(3, 25)
        })
        .run(v.view())
        .unwrap();
        let many = NmfEngine::new(NmfConfig {
            partitions: 4,
            ..config(3, 25)
        })
        .run(v.view())
        .unwrap();
        assert_abs_diff_eq!(single.w(), many.w(), epsilon = 1e-8);
        assert_abs_diff_eq!(single.h(), many.h(), epsilon = 1e-8);
    }

    #[test]
    fn test_different_seeds_differ() {
        let v = sample_matrix();
        let a = NmfEngine::new(config(2, 0)).run(v.view()).unwrap();
        let b = NmfEngine::new(NmfConfig {
            seed: 1,
            ..config(2, 0)
        })
        .run(v.view())
        .unwrap();
        assert_ne!(a.w(), b.w());
    }

    #[test]
    fn test_rejects_invalid_input() {
        let engine = NmfEngine::new(config(2, 5));
        assert!(matches!(
            engine.run(array![[1.0, -0.5], [0.0, 1.0]].view()),
            Err(EvalError::NegativeEntry { row: 0, col: 1, .. })
        ));
        assert!(matches!(
            engine.run(array![[1.0, f64::INFINITY]].view()),
            Err(EvalError::NonFiniteInput { row: 0, col: 1 })
        ));
        assert!(matches!(
            engine.run(Array2::<f64>::zeros((0, 3)).view()),
            Err(EvalError::EmptyInput { .. })
        ));
        assert!(matches!(
            NmfEngine::new(config(0, 5)).run(sample_matrix().view()),
            Err(EvalError::InvalidRank { rank: 0 })
        ));
    }

    #[test]
    fn test_overflow_is_reported_as_instability() {
        let v = Array2::from_elem((64, 3), 1.5e308);
        let result = NmfEngine::new(config(2, 5)).run(v.view());
        assert!(matches!(
            result,
            Err(EvalError::NumericInstability {
                iteration: 1,
                factor: "H"
            })
        ));
    }

    #[test]
    fn test_observer_sees_every_iteration() {
        let v = sample_matrix();
        let mut seen = Vec::new();
        let factors = NmfEngine::new(config(2, 7))
            .run_observed(v.view(), |iteration, objective| seen.push((iteration, objective)))
            .unwrap();
        assert_eq!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (1..=7).collect::<Vec<_>>());
        assert_eq!(seen[6].1, factors.reconstruction_error());
    }

    #[test]
    fn test_tolerance_stops_early() {
        let v = sample_matrix();
        let factors = NmfEngine::new(NmfConfig {
            tolerance: Some(1e-3),
            ..config(2, 500)
        })
        .run(v.view())
        .unwrap();
        assert!(factors.iterations() < 500);
    }

    #[test]
    fn test_non_negative_policies() {
        let ids = vec![PatientId::from("a"), PatientId::from("b")];
        let m = FeatureMatrix::new(ids, array![[1.0, -2.0], [-0.5, 3.0]]).unwrap();
        assert!(matches!(
            NonNegativePolicy::Reject.apply(&m),
            Err(EvalError::NegativeEntry { row: 0, col: 1, .. })
        ));
        assert_eq!(
            NonNegativePolicy::Clamp.apply(&m).unwrap().values(),
            array![[1.0, 0.0], [0.0, 3.0]]
        );
        assert_eq!(
            NonNegativePolicy::Absolute.apply(&m).unwrap().values(),
            array![[1.0, 2.0], [0.5, 3.0]]
        );
    }
}
