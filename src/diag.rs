//! Single-fit EM for the diagonal-covariance Gaussian mixture (spec §4.1).
//!
//! This collapses what the original source implemented as several
//! near-duplicate routines (`get_independent_GMM_2`,
//! `get_independent_GMM_2_with_missing_data`, `get_independent_GMM_3`) into
//! one parameterized routine, per the design note in spec §9: the held-out
//! mask and warm-start parameters are ordinary `Option`s, and the missing
//! data path is a branch inside the M-step rather than a separate function.

use crate::config::{GmmConfig, StopCriterion, TyingMode};
use crate::data::{has_missing, Feature};
use crate::density::{log_density_diag, log_normalize_in_place, safe_log};
use crate::error::{Error, Result};
use crate::tying::apply_tying;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand::Rng;

/// Mixing weights, means and diagonal variances of a fitted (or
/// warm-started) diagonal-covariance GMM.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagParams {
    pub weights: Array1<f64>,
    pub means: Array2<f64>,
    pub variances: Array2<f64>,
}

impl DiagParams {
    pub fn n_clusters(&self) -> usize {
        self.weights.len()
    }

    pub fn n_features(&self) -> usize {
        self.means.ncols()
    }

    fn validate_shape(&self, k: usize, d: usize) -> Result<()> {
        if self.weights.len() != k
            || self.means.nrows() != k
            || self.means.ncols() != d
            || self.variances.nrows() != k
            || self.variances.ncols() != d
        {
            return Err(Error::WarmStartShapeMismatch { k, d });
        }
        Ok(())
    }
}

/// Output of a single diagonal-covariance EM run (spec §4.1: "Outputs").
#[derive(Debug, Clone, PartialEq)]
pub struct DiagFit {
    pub params: DiagParams,
    pub responsibilities: Array2<f64>,
    pub log_likelihood_train: f64,
    pub log_likelihood_held_out: f64,
    pub iterations: u64,
}

fn validate_inputs(
    k: usize,
    x: ArrayView2<f64>,
    held_out: Option<&Array1<bool>>,
) -> Result<(usize, usize)> {
    if k < 1 {
        return Err(Error::InvalidClusterCount(k));
    }
    let (n, d) = x.dim();
    if n < 1 || d < 1 {
        return Err(Error::EmptyData { rows: n, cols: d });
    }
    if let Some(h) = held_out {
        if h.len() != n {
            return Err(Error::HeldOutLengthMismatch {
                got: h.len(),
                expected: n,
            });
        }
    }
    Ok((n, d))
}

fn normalize_to_sum_one(weights: &mut Array1<f64>) {
    let sum: f64 = weights.sum();
    if sum > 0.0 {
        weights.mapv_inplace(|w| w / sum);
    }
}

/// Accumulators for the M-step (spec §4.1, "M-step accumulators"). Kept as
/// a plain struct, rather than threaded positionally, so the sequential and
/// parallel ([`crate::parallel`]) E-step implementations can share it.
pub(crate) struct DiagAccumulators {
    /// s_k: scalar effective count per component.
    pub s: Array1<f64>,
    /// s_square_k: sum of squared responsibilities, for the unbiased
    /// variance rescaling.
    pub s_square: Array1<f64>,
    /// s_{k,d}: per-feature effective count, used only by the missing-data
    /// path (features skip points where they are unobserved).
    pub s_feature: Array2<f64>,
    pub sum_x: Array2<f64>,
    pub sum_x2: Array2<f64>,
}

impl DiagAccumulators {
    pub fn zeros(k: usize, d: usize) -> Self {
        DiagAccumulators {
            s: Array1::zeros(k),
            s_square: Array1::zeros(k),
            s_feature: Array2::zeros((k, d)),
            sum_x: Array2::zeros((k, d)),
            sum_x2: Array2::zeros((k, d)),
        }
    }

    pub fn add_assign(&mut self, other: &DiagAccumulators) {
        self.s += &other.s;
        self.s_square += &other.s_square;
        self.s_feature += &other.s_feature;
        self.sum_x += &other.sum_x;
        self.sum_x2 += &other.sum_x2;
    }

    /// Folds one training point's responsibility row into the accumulators.
    /// Held-out points must never be passed here (spec §4.1: "over n with
    /// H[n]=0").
    pub fn accumulate(&mut self, resp_row: ndarray::ArrayView1<f64>, x_row: ndarray::ArrayView1<f64>) {
        for k in 0..resp_row.len() {
            let p = resp_row[k];
            self.s[k] += p;
            self.s_square[k] += p * p;
            for d in 0..x_row.len() {
                let xd = match Feature::from_sentinel(x_row[d]) {
                    Feature::Missing => continue,
                    Feature::Observed(xd) => xd,
                };
                self.s_feature[[k, d]] += p;
                self.sum_x[[k, d]] += p * xd;
                self.sum_x2[[k, d]] += p * xd * xd;
            }
        }
    }
}

/// The E-step: fills `responsibilities` in place and returns
/// `(ll_train, ll_held)`. Pure function of `params`; does not mutate them.
pub(crate) fn e_step(
    params: &DiagParams,
    x: ArrayView2<f64>,
    held_out: Option<&Array1<bool>>,
    responsibilities: &mut Array2<f64>,
) -> (f64, f64) {
    let log_weights = params.weights.mapv(safe_log);
    let k = params.n_clusters();
    let mut ll_train = 0.0;
    let mut ll_held = 0.0;

    for (i, x_row) in x.outer_iter().enumerate() {
        let mut log_joint = Array1::<f64>::zeros(k);
        for kk in 0..k {
            log_joint[kk] = log_weights[kk]
                + log_density_diag(x_row, params.means.row(kk), params.variances.row(kk));
        }
        let ll = log_normalize_in_place(&mut log_joint);
        responsibilities.row_mut(i).assign(&log_joint);

        if held_out.map_or(false, |h| h[i]) {
            ll_held += ll;
        } else {
            ll_train += ll;
        }
    }
    (ll_train, ll_held)
}

/// Accumulates the M-step sums over every training (non-held-out) point.
pub(crate) fn accumulate_m_step(
    x: ArrayView2<f64>,
    responsibilities: &Array2<f64>,
    held_out: Option<&Array1<bool>>,
) -> DiagAccumulators {
    let (_n, d) = x.dim();
    let k = responsibilities.ncols();
    let mut acc = DiagAccumulators::zeros(k, d);
    for (i, x_row) in x.outer_iter().enumerate() {
        if held_out.map_or(false, |h| h[i]) {
            continue;
        }
        acc.accumulate(responsibilities.row(i), x_row);
    }
    acc
}

/// Turns the accumulated sums into new parameters (spec §4.1, "M-step
/// update"). `previous_means` lets us freeze a component's mean when its
/// effective count collapsed to ~0, rather than dividing by it.
/// Returns the new parameters plus whether every raw (pre-`var_offset`)
/// variance entry underflowed to exactly 0 -- the "all variances underflow
/// simultaneously" failure condition of spec §4.1's "Failure" list,
/// distinct from the ordinary per-entry clamping the M-step update already
/// performs for numerical stability.
fn finalize_m_step(
    acc: &DiagAccumulators,
    previous_means: Option<&Array2<f64>>,
    config: &GmmConfig,
    warned_empty_cluster: &mut bool,
) -> (DiagParams, bool) {
    let k = acc.s.len();
    let d = acc.sum_x.ncols();
    let missing = acc.s_feature.iter().zip(acc.s.iter()).any(|(sf, &s)| {
        // s_feature is only ever populated differently from the broadcast
        // scalar s when some feature was skipped for some point.
        (sf - s).abs() > 1e-9
    });

    let mut weights = acc.s.clone();
    normalize_to_sum_one(&mut weights);

    let mut means = Array2::<f64>::zeros((k, d));
    let mut variances = Array2::<f64>::zeros((k, d));

    for kk in 0..k {
        let s_k = acc.s[kk];
        let freeze_mean = s_k <= 10.0 * f64::EPSILON;
        if freeze_mean && !*warned_empty_cluster {
            log::warn!("at least one cluster has no members");
            *warned_empty_cluster = true;
        }

        for dd in 0..d {
            let denom = if missing {
                let sf = acc.s_feature[[kk, dd]];
                if sf <= 10.0 * f64::EPSILON {
                    if !*warned_empty_cluster {
                        log::warn!("at least one cluster has no members");
                        *warned_empty_cluster = true;
                    }
                    1.0
                } else {
                    sf
                }
            } else if freeze_mean {
                1.0
            } else {
                s_k
            };

            let mean_kd = if freeze_mean && !missing {
                previous_means.map_or(0.0, |m| m[[kk, dd]])
            } else {
                acc.sum_x[[kk, dd]] / denom
            };
            means[[kk, dd]] = mean_kd;

            let raw_var = acc.sum_x2[[kk, dd]] / denom - mean_kd * mean_kd;
            variances[[kk, dd]] = raw_var.max(0.0);
        }
    }

    if config.use_unbiased_var_estimate_in_m_step {
        for kk in 0..k {
            let s_k = acc.s[kk];
            if s_k <= 0.0 {
                continue;
            }
            let factor = 1.0 - acc.s_square[kk] / (s_k * s_k);
            if factor > 1e-9 {
                for dd in 0..d {
                    variances[[kk, dd]] /= factor;
                }
            }
        }
    }

    let all_underflowed = variances.iter().all(|&v| v <= 0.0);

    apply_tying(&mut variances, config.tying_mode());
    variances.mapv_inplace(|v| v + config.var_offset);

    (
        DiagParams {
            weights,
            means,
            variances,
        },
        all_underflowed,
    )
}

/// Runs EM to convergence for a fixed number of clusters `k` (spec §4.1:
/// `fit_diag`). `x` may contain the missing-value sentinel (`NaN`);
/// handling switches on automatically as soon as any value is missing.
pub fn fit_diag<R: Rng>(
    config: &GmmConfig,
    k: usize,
    x: ArrayView2<f64>,
    held_out: Option<&Array1<bool>>,
    warm_start: Option<&DiagParams>,
    rng: &mut R,
) -> Result<DiagFit> {
    config.validate()?;
    let (n, d) = validate_inputs(k, x, held_out)?;

    let warm = config.use_initialized_cluster_means_variances_and_priors;
    if warm && warm_start.is_none() {
        return Err(Error::MissingWarmStart);
    }
    if let Some(ws) = warm_start {
        ws.validate_shape(k, d)?;
    }

    if warm && config.max_iterations == 0 {
        // spec §8 boundary invariant: with a warm start and zero
        // iterations, the returned parameters equal the initial ones
        // exactly. We still compute a best-effort E-step (on a
        // defensively var_offset-padded copy) so callers get usable
        // responsibilities and log-likelihoods.
        let ws = warm_start.unwrap();
        let mut padded = ws.clone();
        normalize_to_sum_one(&mut padded.weights);
        padded.variances.mapv_inplace(|v| v + config.var_offset);
        let mut responsibilities = Array2::<f64>::zeros((n, k));
        let (ll_train, ll_held) = e_step(&padded, x, held_out, &mut responsibilities);
        let mut params = ws.clone();
        normalize_to_sum_one(&mut params.weights);
        return Ok(DiagFit {
            params,
            responsibilities,
            log_likelihood_train: ll_train,
            log_likelihood_held_out: ll_held,
            iterations: 0,
        });
    }

    // Non-warm-started fits with max_iterations == 0 still perform one
    // internal pass (random init + a single M-step) so a well-defined
    // model is always returned; that pass is not counted towards
    // `iterations` since no E-step/convergence check against real
    // parameters occurred (see DESIGN.md).
    let forced_minimum_pass = !warm && config.max_iterations == 0;
    let total_passes = config.max_iterations.max(1);

    let mut params: Option<DiagParams> = if warm {
        let ws = warm_start.unwrap();
        let mut p = ws.clone();
        normalize_to_sum_one(&mut p.weights);
        p.variances.mapv_inplace(|v| v + config.var_offset);
        Some(p)
    } else {
        None
    };

    let mut responsibilities = Array2::<f64>::zeros((n, k));
    let mut ll_train = 0.0_f64;
    let mut ll_held = 0.0_f64;
    let mut prev_metric = f64::NEG_INFINITY;
    let mut iters_done: u64 = 0;
    let mut warned_empty_cluster = false;
    let mut warned_ll_decrease = false;

    for iter in 0..total_passes {
        if config.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let is_first_random_init = iter == 0 && !warm;

        let acc = if is_first_random_init {
            responsibilities = crate::init::init_responsibilities(n, k, rng);
            // The original leaves the log-likelihood accumulators at their
            // zero-initialized sentinel for this pass, since no density
            // was evaluated yet.
            ll_train = 0.0;
            ll_held = 0.0;
            accumulate_m_step(x, &responsibilities, held_out)
        } else {
            let p = params
                .as_ref()
                .expect("params are initialized before any non-initial pass");
            if config.num_threads > 1 {
                let (t, h, acc) = crate::parallel::e_step_and_accumulate(
                    p,
                    x,
                    held_out,
                    &mut responsibilities,
                    config.num_threads,
                );
                ll_train = t;
                ll_held = h;
                acc
            } else {
                let (t, h) = e_step(p, x, held_out, &mut responsibilities);
                ll_train = t;
                ll_held = h;
                accumulate_m_step(x, &responsibilities, held_out)
            }
        };

        let previous_means = params.as_ref().map(|p| &p.means);
        let (new_params, all_underflowed) =
            finalize_m_step(&acc, previous_means, config, &mut warned_empty_cluster);
        if all_underflowed {
            return Err(Error::AllVariancesUnderflowed);
        }

        let weight_sum: f64 = new_params.weights.sum();
        if (weight_sum - 1.0).abs() > 1e-5 {
            log::warn!(
                "mixing weights sum to {:.6}, expected 1.0 within 1e-5",
                weight_sum
            );
        }

        params = Some(new_params);

        if forced_minimum_pass {
            break;
        }

        if iter > 0 || warm {
            let metric = match config.stop_criterion() {
                StopCriterion::TrainingLogLikelihood => ll_train,
                StopCriterion::HeldOutLogLikelihood => ll_held,
            };
            if metric < prev_metric && !warned_ll_decrease {
                log::warn!("log-likelihood decreased across an iteration");
                warned_ll_decrease = true;
            }
            let denom = metric.abs() + prev_metric.abs();
            let delta = if denom > 0.0 {
                2.0 * (metric - prev_metric) / denom
            } else {
                0.0
            };
            prev_metric = metric;
            iters_done = iter + 1;
            if delta.abs() < config.iteration_tolerance {
                break;
            }
        } else {
            prev_metric = match config.stop_criterion() {
                StopCriterion::TrainingLogLikelihood => ll_train,
                StopCriterion::HeldOutLogLikelihood => ll_held,
            };
            iters_done = iter + 1;
        }
    }

    if forced_minimum_pass {
        iters_done = 0;
    }

    Ok(DiagFit {
        params: params.expect("at least one pass always runs"),
        responsibilities,
        log_likelihood_train: ll_train,
        log_likelihood_held_out: ll_held,
        iterations: iters_done,
    })
}

/// Whether `x` requires the missing-data bookkeeping path. Exposed so
/// callers (e.g. the model-selection controller) can short-circuit before
/// spending a pass on it.
pub fn requires_missing_data_handling(x: ArrayView2<f64>) -> bool {
    has_missing(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand::SeedableRng;
    use rand_isaac::Isaac64Rng;

    fn three_blobs() -> Array2<f64> {
        let centers = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)];
        let mut rng = Isaac64Rng::seed_from_u64(42);
        let mut rows = Vec::new();
        for &(cx, cy) in &centers {
            for _ in 0..60 {
                let dx: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                let dy: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                rows.push([cx + dx, cy + dy]);
            }
        }
        Array2::from(rows.into_iter().map(|r| r.to_vec()).collect::<Vec<_>>())
    }

    use ndarray_rand::rand::Rng as _;

    #[test]
    fn weights_sum_to_one_and_variances_respect_the_floor() {
        let x = three_blobs();
        let config = GmmConfig::default();
        let mut rng = Isaac64Rng::seed_from_u64(1);
        let fit = fit_diag(&config, 3, x.view(), None, None, &mut rng).unwrap();
        assert_abs_diff_eq!(fit.params.weights.sum(), 1.0, epsilon = 1e-5);
        assert!(fit
            .params
            .variances
            .iter()
            .all(|&v| v >= config.var_offset - 1e-12));
        for row in fit.responsibilities.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn k_equals_one_returns_the_sample_mean_and_variance() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let config = GmmConfig::default();
        let mut rng = Isaac64Rng::seed_from_u64(2);
        let fit = fit_diag(&config, 1, x.view(), None, None, &mut rng).unwrap();
        assert_abs_diff_eq!(fit.params.weights[0], 1.0, epsilon = 1e-10);
        let expected_mean = x.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(
            fit.params.means.row(0)[0],
            expected_mean[0],
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(
            fit.params.means.row(0)[1],
            expected_mean[1],
            epsilon = 1e-6
        );
    }

    #[test]
    fn warm_start_with_zero_iterations_is_returned_unchanged() {
        let x = three_blobs();
        let mut config = GmmConfig::default();
        config.use_initialized_cluster_means_variances_and_priors = true;
        config.max_iterations = 0;
        let warm = DiagParams {
            weights: Array1::from(vec![0.5, 0.25, 0.25]),
            means: Array2::from_shape_vec((3, 2), vec![0.0, 0.0, 10.0, 0.0, 0.0, 10.0]).unwrap(),
            variances: Array2::from_elem((3, 2), 1.0),
        };
        let mut rng = Isaac64Rng::seed_from_u64(3);
        let fit = fit_diag(&config, 3, x.view(), None, Some(&warm), &mut rng).unwrap();
        assert_eq!(fit.iterations, 0);
        assert_abs_diff_eq!(fit.params.weights[0], warm.weights[0], epsilon = 1e-12);
        assert_abs_diff_eq!(fit.params.means[[0, 0]], warm.means[[0, 0]], epsilon = 1e-12);
        assert_abs_diff_eq!(
            fit.params.variances[[0, 0]],
            warm.variances[[0, 0]],
            epsilon = 1e-12
        );
    }

    #[test]
    fn held_out_fraction_zero_is_equivalent_to_held_out_disabled() {
        let x = three_blobs();
        let config = GmmConfig::default();
        let mut rng1 = Isaac64Rng::seed_from_u64(9);
        let fit_without = fit_diag(&config, 3, x.view(), None, None, &mut rng1).unwrap();

        let n = x.nrows();
        let mut rng2 = Isaac64Rng::seed_from_u64(9);
        let no_held_out = Array1::from(vec![false; n]);
        let fit_with_empty_mask =
            fit_diag(&config, 3, x.view(), Some(&no_held_out), None, &mut rng2).unwrap();

        assert_abs_diff_eq!(
            fit_without.log_likelihood_train,
            fit_with_empty_mask.log_likelihood_train,
            epsilon = 1e-8
        );
    }

    #[test]
    fn tied_variance_recovery() {
        let mut rng = Isaac64Rng::seed_from_u64(5);
        let mut rows = Vec::new();
        for &cx in &[0.0, 20.0] {
            for _ in 0..250 {
                let dx: f64 = rng.sample::<f64, _>(ndarray_rand::rand_distr::StandardNormal) * 2.0;
                let dy: f64 = rng.sample::<f64, _>(ndarray_rand::rand_distr::StandardNormal) * 2.0;
                rows.push(vec![cx + dx, dy]);
            }
        }
        let x = Array2::from_shape_vec((500, 2), rows.into_iter().flatten().collect()).unwrap();

        let mut config = GmmConfig::default();
        config.tie_var = true;
        let mut fit_rng = Isaac64Rng::seed_from_u64(123);
        let fit = fit_diag(&config, 2, x.view(), None, None, &mut fit_rng).unwrap();

        assert_abs_diff_eq!(
            fit.params.variances[[0, 0]],
            fit.params.variances[[1, 0]],
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            fit.params.variances[[0, 1]],
            fit.params.variances[[1, 1]],
            epsilon = 1e-9
        );
    }

    #[test]
    fn identical_points_in_every_component_underflow_every_variance() {
        // A single repeated point has zero sample variance in every
        // feature, for every component, on every iteration -- the
        // degenerate case the "all variances underflow simultaneously"
        // failure guards against.
        let x = Array2::from_shape_vec((6, 2), vec![3.0; 12]).unwrap();
        let config = GmmConfig::default();
        let mut rng = Isaac64Rng::seed_from_u64(17);
        let err = fit_diag(&config, 2, x.view(), None, None, &mut rng).unwrap_err();
        assert!(matches!(err, Error::AllVariancesUnderflowed));
    }

    #[test]
    fn a_pre_tripped_cancellation_token_aborts_before_the_first_iteration() {
        let x = three_blobs();
        let mut config = GmmConfig::default();
        let token = crate::config::CancellationToken::new();
        token.cancel();
        config.cancellation = Some(token);
        let mut rng = Isaac64Rng::seed_from_u64(6);
        let err = fit_diag(&config, 3, x.view(), None, None, &mut rng).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn missing_data_recovers_means_close_to_full_data_fit() {
        let x = three_blobs();
        let mut x_missing = x.clone();
        let mut rng = Isaac64Rng::seed_from_u64(21);
        for v in x_missing.iter_mut() {
            if rng.gen::<f64>() < 0.2 {
                *v = f64::NAN;
            }
        }
        let config = GmmConfig::default();
        let mut fit_rng = Isaac64Rng::seed_from_u64(22);
        let fit = fit_diag(&config, 3, x_missing.view(), None, None, &mut fit_rng).unwrap();
        assert!(fit
            .params
            .means
            .iter()
            .all(|m| m.is_finite() && m.abs() < 20.0));
    }
}
