//! Closed-form Gaussian log-densities and the log-sum-exp normalization
//! primitive shared by every E-step.
//!
//! Design note: the original source hand-coded log-sum-exp separately in
//! each of its EM variants (`ow_exp_scale_by_sum_log_vector`, inlined).
//! [`log_normalize_in_place`] is the single factored-out primitive
//! referenced in spec §9 ("Log-sum-exp hand-coded per loop").

use crate::data::Feature;
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::SVD;

const LOG_TWO_PI: f64 = 1.837_877_066_409_345_5;

/// `ln(x)` clamped so a zero or negative argument never produces `-inf`/NaN;
/// mirrors the `SAFE_LOG` macro of the reference implementation.
pub fn safe_log(x: f64) -> f64 {
    x.max(f64::MIN_POSITIVE).ln()
}

/// Log density of a diagonal-covariance Gaussian at `x`, skipping any
/// feature where `x[d]` is the missing-value sentinel (`NaN`). The additive
/// constant `(d_eff/2) * ln(2*pi)` is dropped: it depends only on which
/// features of `x` are observed, not on the component `k`, so it cancels
/// out of the per-point log-sum-exp normalization in the E-step (spec
/// §4.1: "The constant term may be dropped consistently").
pub fn log_density_diag(x: ArrayView1<f64>, mean: ArrayView1<f64>, var: ArrayView1<f64>) -> f64 {
    let mut quad = 0.0;
    let mut log_det = 0.0;
    for ((&xi, &mu), &v) in x.iter().zip(mean.iter()).zip(var.iter()) {
        let xi = match Feature::from_sentinel(xi) {
            Feature::Missing => continue,
            Feature::Observed(xi) => xi,
        };
        let dev = xi - mu;
        quad += (dev * dev) / v;
        log_det += safe_log(v);
    }
    -0.5 * (quad + log_det)
}

/// Inverse and log-determinant of a symmetric positive-definite covariance
/// matrix, computed from its SVD (spec §4.2: "S_k⁻¹ and det S_k obtained
/// from an SVD factorization"). Fails with [`Error::SingularCovariance`]
/// when a singular value is negligible relative to the largest one.
pub fn svd_inverse_and_log_det(cov: &Array2<f64>, cluster: usize) -> Result<(Array2<f64>, f64)> {
    let (u, s, vt) = cov
        .to_owned()
        .svd(true, true)
        .map_err(|_| Error::SingularCovariance { cluster })?;
    let u = u.ok_or(Error::SingularCovariance { cluster })?;
    let vt = vt.ok_or(Error::SingularCovariance { cluster })?;

    let max_sv = s.iter().cloned().fold(0.0_f64, f64::max);
    let rank_eps = max_sv * (cov.nrows() as f64) * f64::EPSILON.sqrt();
    if s.iter().any(|&sv| sv <= rank_eps) {
        return Err(Error::SingularCovariance { cluster });
    }

    let log_det = s.iter().map(|&sv| sv.ln()).sum();
    let inv_sigma = Array2::from_diag(&s.mapv(|sv| 1.0 / sv));
    let inverse = vt.t().dot(&inv_sigma).dot(&u.t());
    Ok((inverse, log_det))
}

/// Log density of a full-covariance Gaussian at `x`, given the inverse
/// covariance and its log-determinant (see [`svd_inverse_and_log_det`]).
pub fn log_density_full(
    x: ArrayView1<f64>,
    mean: ArrayView1<f64>,
    inv_cov: ArrayView2<f64>,
    log_det: f64,
) -> f64 {
    let diff = &x.to_owned() - &mean;
    let quad = diff.dot(&inv_cov.dot(&diff));
    let n_features = x.len() as f64;
    -0.5 * (quad + log_det + n_features * LOG_TWO_PI)
}

/// Normalizes a row of unnormalized log-joint probabilities `log a_k +
/// log N(x | mu_k, Sigma_k)` into a responsibility row summing to 1, via
/// log-sum-exp. Returns the log-sum-exp value itself, i.e. the point's
/// contribution to the (training or held-out) log-likelihood.
pub fn log_normalize_in_place(v: &mut Array1<f64>) -> f64 {
    let max = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let sum_exp: f64 = v.iter().map(|&x| (x - max).exp()).sum();
    let log_sum = max + safe_log(sum_exp);
    v.mapv_inplace(|x| (x - log_sum).exp());
    log_sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn log_density_diag_matches_closed_form_at_the_mean() {
        let x = array![0.0, 0.0];
        let mean = array![0.0, 0.0];
        let var = array![1.0, 1.0];
        let got = log_density_diag(x.view(), mean.view(), var.view());
        // -0.5 * (0 + ln(1) + ln(1)) = 0
        assert_abs_diff_eq!(got, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn log_density_diag_skips_missing_features() {
        let x = array![f64::NAN, 3.0];
        let mean = array![10.0, 3.0];
        let var = array![1.0, 1.0];
        let got = log_density_diag(x.view(), mean.view(), var.view());
        assert_abs_diff_eq!(got, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn log_normalize_in_place_produces_a_probability_vector() {
        let mut v = array![1.0, 2.0, 3.0];
        let log_sum = log_normalize_in_place(&mut v);
        assert_abs_diff_eq!(v.sum(), 1.0, epsilon = 1e-10);
        assert!(log_sum.is_finite());
        assert!(v[2] > v[1] && v[1] > v[0]);
    }
}
