//! Error types for the GMM estimator.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("num_clusters must be at least 1, got {0}")]
    InvalidClusterCount(usize),
    #[error("feature matrix has {rows} rows and {cols} columns; both must be at least 1")]
    EmptyData { rows: usize, cols: usize },
    #[error("held-out mask has length {got}, expected {expected} (one entry per row of X)")]
    HeldOutLengthMismatch { got: usize, expected: usize },
    #[error("held_out_data_fraction must lie in (0, 1), got {0}")]
    InvalidHeldOutFraction(f64),
    #[error(
        "use_initialized_cluster_means_variances_and_priors is set but no initial parameters were supplied"
    )]
    MissingWarmStart,
    #[error("warm-start parameters have shape incompatible with K={k}, D={d}")]
    WarmStartShapeMismatch { k: usize, d: usize },
    #[error("all component variances underflowed simultaneously; data may be degenerate")]
    AllVariancesUnderflowed,
    #[error("covariance does not have full rank (component {cluster})")]
    SingularCovariance { cluster: usize },
    #[error("all mixture components were removed during back-off")]
    AllComponentsBackedOff,
    #[error("covariance_mask has shape {got:?}, expected ({d}, {d})")]
    CovarianceMaskShapeMismatch { got: (usize, usize), d: usize },
    #[error("{0:?} is not a recognized configuration option")]
    UnknownOption(String),
    #[error("invalid value {value:?} for option {option}")]
    InvalidOptionValue { option: String, value: String },
    #[error("num_tries_per_cluster_count and num_cluster_count_samples must be at least 1")]
    InvalidSweepParameters,
    #[error("fit was cancelled by caller")]
    Cancelled,
}
