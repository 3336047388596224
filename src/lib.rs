//! Expectation-Maximization estimation of Gaussian Mixture Models.
//!
//! This crate fits mixtures of multivariate Gaussians to numeric feature
//! vectors via EM, supports model selection over the number of mixture
//! components, and tolerates missing feature values (encoded as `NaN`).
//!
//! Kin in spirit to `linfa-clustering`'s own Gaussian Mixture Model, this
//! implementation follows a different lineage: it is a port of a
//! held-out/training-MDL driven model-selection GMM library rather than
//! scikit-learn's GMM, and keeps the diagonal-covariance path as its
//! primary, best-tested surface (full covariance is supported but
//! secondary -- see [`full`]).
//!
//! ## Quick start
//!
//! ```
//! use gmm_em::{fit_diag, GmmConfig};
//! use ndarray::array;
//! use ndarray_rand::rand::SeedableRng;
//! use rand_isaac::Isaac64Rng;
//!
//! let x = array![
//!     [0.0, 0.0], [0.1, -0.1], [-0.1, 0.1],
//!     [10.0, 10.0], [10.1, 9.9], [9.9, 10.1],
//! ];
//! let config = GmmConfig::default();
//! let mut rng = Isaac64Rng::seed_from_u64(0);
//! let fit = fit_diag(&config, 2, x.view(), None, None, &mut rng).unwrap();
//! assert_eq!(fit.params.means.nrows(), 2);
//! ```

pub mod bic;
pub mod config;
pub mod data;
pub mod density;
pub mod diag;
pub mod error;
pub mod facade;
pub mod full;
pub mod init;
pub mod parallel;
pub mod selection;
pub mod tying;

pub use config::{CancellationToken, GmmConfig, OptionStore, StopCriterion, TyingMode};
pub use diag::{fit_diag, DiagFit, DiagParams};
pub use error::{Error, Result};
pub use facade::{fit, FitOutput, FitTarget};
pub use full::{fit_full, FullFit, FullParams};
pub use selection::{select, KDiagnostic, SelectedParams, SelectionResult};

/// Which covariance structure a model uses. Diagonal is the primary,
/// best-tested surface (spec §1); full covariance is supported but
/// secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovarianceKind {
    Diagonal,
    Full,
}
