use thiserror::Error;

/// Result alias used across the evaluation core.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Everything that can stop an evaluation run. None of these are retried;
/// the caller gets them as-is.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Empty input: {context}.")]
    EmptyInput { context: &'static str },

    #[error("Feature vector for patient '{patient}' has {found} dimensions, expected {expected}.")]
    DimensionMismatch {
        patient: String,
        expected: usize,
        found: usize,
    },

    #[error("Vector has {found} dimensions, but the fitted model expects {expected}.")]
    VectorLength { expected: usize, found: usize },

    #[error("Non-finite value at row {row}, column {col}.")]
    NonFiniteInput { row: usize, col: usize },

    #[error("Negative entry {value} at row {row}, column {col}; NMF input must be non-negative.")]
    NegativeEntry { row: usize, col: usize, value: f64 },

    #[error("NMF rank must be at least 1, but was {rank}.")]
    InvalidRank { rank: usize },

    #[error("Number of principal components must be at least 1, but was {requested}.")]
    InvalidComponents { requested: usize },

    #[error("Cannot form {requested} clusters from {rows} rows.")]
    InvalidClusterCount { requested: usize, rows: usize },

    #[error("{method} clustering failed: {reason}")]
    Clustering { method: &'static str, reason: String },

    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("At least {required} rows are required, found {found}.")]
    InsufficientSamples { required: usize, found: usize },

    #[error("Numeric instability: non-finite values in {factor} after iteration {iteration}. Scale the input before factorization.")]
    NumericInstability {
        iteration: usize,
        factor: &'static str,
    },

    #[error("Purity is undefined for an empty assignment set; no patient has both a cluster and a label.")]
    EmptyEvaluation,

    #[error("Unknown phenotype code {0}; expected 1 (case), 2 (control) or 3 (unknown).")]
    UnknownPhenotypeCode(i64),

    #[error("Matrix shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}
