//! Single-fit EM for the full-covariance Gaussian mixture (spec §4.2).
//!
//! Shares its skeleton with [`crate::diag`] -- random/warm-start init, E-step,
//! accumulate, M-step, convergence check -- but carries a D x D covariance
//! per component instead of a diagonal variance vector, and adds the
//! effective-count back-off the diagonal variant does not have (spec §9,
//! Open Question #4: the asymmetry is preserved as-is).

use crate::config::GmmConfig;
use crate::density::{log_density_full, log_normalize_in_place, safe_log, svd_inverse_and_log_det};
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand::Rng;

/// The effective-count floor below which a component is removed during
/// back-off (spec §4.1, "Empty-cluster back-off"; §9 Open Question #4).
const BACKOFF_EFFECTIVE_COUNT_THRESHOLD: f64 = 1.5;

#[derive(Debug, Clone, PartialEq)]
pub struct FullParams {
    pub weights: Array1<f64>,
    pub means: Array2<f64>,
    /// One D x D covariance matrix per component.
    pub covariances: Vec<Array2<f64>>,
}

impl FullParams {
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
            || self.covariances.len() != k
            || self.covariances.iter().any(|c| c.dim() != (d, d))
        {
            return Err(Error::WarmStartShapeMismatch { k, d });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullFit {
    pub params: FullParams,
    /// N x K, N fixed at the caller's original row count; outlier rows
    /// (see `outliers`) have an all-zero responsibility row.
    pub responsibilities: Array2<f64>,
    pub log_likelihood_train: f64,
    pub log_likelihood_held_out: f64,
    pub iterations: u64,
    /// Component count actually returned. May be smaller than the
    /// requested `k` if back-off removed components.
    pub k_final: usize,
    /// Points whose responsibilities collapsed to (numerically) zero for
    /// every remaining component; excluded from the M-step and from
    /// `num_good_points`.
    pub outliers: Array1<bool>,
    pub num_good_points: usize,
}

fn validate_inputs(
    k: usize,
    x: ArrayView2<f64>,
    held_out: Option<&Array1<bool>>,
    covariance_mask: Option<ArrayView2<f64>>,
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
    if let Some(mask) = covariance_mask {
        if mask.dim() != (d, d) {
            return Err(Error::CovarianceMaskShapeMismatch {
                got: mask.dim(),
                d,
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

/// Per-component cached inverse and log-determinant, computed once per
/// M-step and reused for every point in the next E-step.
struct Cache {
    inv_cov: Vec<Array2<f64>>,
    log_det: Vec<f64>,
}

fn build_cache(covariances: &[Array2<f64>]) -> Result<Cache> {
    let mut inv_cov = Vec::with_capacity(covariances.len());
    let mut log_det = Vec::with_capacity(covariances.len());
    for (cluster, cov) in covariances.iter().enumerate() {
        let (inv, det) = svd_inverse_and_log_det(cov, cluster)?;
        inv_cov.push(inv);
        log_det.push(det);
    }
    Ok(Cache { inv_cov, log_det })
}

/// Initial covariances for a random start: the sample covariance of the
/// whole dataset, repeated per component. Mirrors the diagonal path's use
/// of `init_responsibilities` to bootstrap an M-step, but full covariance
/// needs a non-degenerate starting point before any responsibilities exist.
fn init_covariances(x: ArrayView2<f64>, k: usize, var_offset: f64) -> Vec<Array2<f64>> {
    let d = x.ncols();
    let mean = x.mean_axis(Axis(0)).expect("x has at least one row");
    let mut cov = Array2::<f64>::zeros((d, d));
    let n = x.nrows() as f64;
    for row in x.outer_iter() {
        let diff = &row.to_owned() - &mean;
        for i in 0..d {
            for j in 0..d {
                cov[[i, j]] += diff[i] * diff[j];
            }
        }
    }
    cov.mapv_inplace(|v| v / n);
    for i in 0..d {
        cov[[i, i]] += var_offset;
    }
    (0..k).map(|_| cov.clone()).collect()
}

fn e_step(
    weights: &Array1<f64>,
    means: &Array2<f64>,
    cache: &Cache,
    x: ArrayView2<f64>,
    held_out: Option<&Array1<bool>>,
    responsibilities: &mut Array2<f64>,
    outliers: &mut Array1<bool>,
) -> (f64, f64, usize) {
    let log_weights = weights.mapv(safe_log);
    let k = weights.len();
    let mut ll_train = 0.0;
    let mut ll_held = 0.0;
    let mut num_good_points = 0usize;

    for (i, x_row) in x.outer_iter().enumerate() {
        let mut log_joint = Array1::<f64>::zeros(k);
        for kk in 0..k {
            log_joint[kk] = log_weights[kk]
                + log_density_full(x_row, means.row(kk), cache.inv_cov[kk].view(), cache.log_det[kk]);
        }
        let max = log_joint.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            // Every component assigns this point zero density: an outlier,
            // not an error. It contributes nothing to the M-step and is
            // not counted in either log-likelihood.
            outliers[i] = true;
            responsibilities.row_mut(i).fill(0.0);
            continue;
        }
        outliers[i] = false;
        num_good_points += 1;
        let ll = log_normalize_in_place(&mut log_joint);
        responsibilities.row_mut(i).assign(&log_joint);

        if held_out.map_or(false, |h| h[i]) {
            ll_held += ll;
        } else {
            ll_train += ll;
        }
    }
    (ll_train, ll_held, num_good_points)
}

struct Accumulators {
    s: Array1<f64>,
    sum_x: Array2<f64>,
}

fn accumulate(
    x: ArrayView2<f64>,
    responsibilities: &Array2<f64>,
    held_out: Option<&Array1<bool>>,
    outliers: &Array1<bool>,
) -> Accumulators {
    let (_n, d) = x.dim();
    let k = responsibilities.ncols();
    let mut s = Array1::<f64>::zeros(k);
    let mut sum_x = Array2::<f64>::zeros((k, d));
    for (i, x_row) in x.outer_iter().enumerate() {
        if outliers[i] || held_out.map_or(false, |h| h[i]) {
            continue;
        }
        let r = responsibilities.row(i);
        for kk in 0..k {
            s[kk] += r[kk];
            for dd in 0..d {
                sum_x[[kk, dd]] += r[kk] * x_row[dd];
            }
        }
    }
    Accumulators { s, sum_x }
}

fn finalize_m_step(
    x: ArrayView2<f64>,
    responsibilities: &Array2<f64>,
    held_out: Option<&Array1<bool>>,
    outliers: &Array1<bool>,
    acc: &Accumulators,
    config: &GmmConfig,
    covariance_mask: Option<ArrayView2<f64>>,
) -> (Array1<f64>, Array2<f64>, Vec<Array2<f64>>) {
    let k = acc.s.len();
    let d = acc.sum_x.ncols();

    let mut weights = acc.s.clone();
    normalize_to_sum_one(&mut weights);

    let mut means = Array2::<f64>::zeros((k, d));
    for kk in 0..k {
        let s_k = acc.s[kk];
        if s_k > 10.0 * f64::EPSILON {
            for dd in 0..d {
                means[[kk, dd]] = acc.sum_x[[kk, dd]] / s_k;
            }
        }
    }

    let mut covariances = Vec::with_capacity(k);
    for kk in 0..k {
        let s_k = acc.s[kk];
        let mut cov = Array2::<f64>::zeros((d, d));
        if s_k > 10.0 * f64::EPSILON {
            for (i, x_row) in x.outer_iter().enumerate() {
                if outliers[i] || held_out.map_or(false, |h| h[i]) {
                    continue;
                }
                let r = responsibilities[[i, kk]];
                if r == 0.0 {
                    continue;
                }
                let diff = &x_row.to_owned() - &means.row(kk);
                for a in 0..d {
                    for b in 0..d {
                        cov[[a, b]] += r * diff[a] * diff[b];
                    }
                }
            }
            cov.mapv_inplace(|v| v / s_k);
        }
        for a in 0..d {
            cov[[a, a]] += config.var_offset;
        }
        if let Some(mask) = covariance_mask {
            cov = &cov * &mask;
        }
        covariances.push(cov);
    }

    (weights, means, covariances)
}

/// Removes every component whose effective count is below
/// [`BACKOFF_EFFECTIVE_COUNT_THRESHOLD`], renormalizing what remains (spec
/// §4.1, "Empty-cluster back-off"). Returns the number of components
/// removed.
fn back_off(
    weights: &mut Array1<f64>,
    means: &mut Array2<f64>,
    covariances: &mut Vec<Array2<f64>>,
    effective_counts: &Array1<f64>,
) -> usize {
    let keep: Vec<usize> = (0..weights.len())
        .filter(|&k| effective_counts[k] >= BACKOFF_EFFECTIVE_COUNT_THRESHOLD)
        .collect();
    let removed = weights.len() - keep.len();
    if removed == 0 {
        return 0;
    }
    *weights = Array1::from(keep.iter().map(|&k| weights[k]).collect::<Vec<_>>());
    normalize_to_sum_one(weights);
    *means = Array2::from_shape_fn((keep.len(), means.ncols()), |(i, d)| means[[keep[i], d]]);
    *covariances = keep.iter().map(|&k| covariances[k].clone()).collect();
    removed
}

/// Runs EM to convergence for a full-covariance mixture. `covariance_mask`,
/// when given, is applied elementwise to every component's covariance after
/// each M-step (spec §4.2: "optionally multiply elementwise by a
/// caller-supplied covariance mask").
pub fn fit_full<R: Rng>(
    config: &GmmConfig,
    k: usize,
    x: ArrayView2<f64>,
    held_out: Option<&Array1<bool>>,
    warm_start: Option<&FullParams>,
    covariance_mask: Option<ArrayView2<f64>>,
    rng: &mut R,
) -> Result<FullFit> {
    config.validate()?;
    let (n, d) = validate_inputs(k, x, held_out, covariance_mask)?;

    let warm = config.use_initialized_cluster_means_variances_and_priors;
    if warm && warm_start.is_none() {
        return Err(Error::MissingWarmStart);
    }
    if let Some(ws) = warm_start {
        ws.validate_shape(k, d)?;
    }

    let (mut weights, mut means, mut covariances) = if warm {
        let ws = warm_start.unwrap();
        let mut w = ws.weights.clone();
        normalize_to_sum_one(&mut w);
        (w, ws.means.clone(), ws.covariances.clone())
    } else {
        let resp = crate::init::init_responsibilities(n, k, rng);
        let outliers = Array1::from_elem(n, false);
        let acc = accumulate(x, &resp, held_out, &outliers);
        let (w, m, _c) = finalize_m_step(
            x, &resp, held_out, &outliers, &acc, config, covariance_mask,
        );
        (w, m, init_covariances(x, k, config.var_offset))
    };

    if warm && config.max_iterations == 0 {
        let cache = build_cache(&covariances)?;
        let mut responsibilities = Array2::<f64>::zeros((n, weights.len()));
        let mut outliers = Array1::from_elem(n, false);
        let (ll_train, ll_held, num_good_points) = e_step(
            &weights, &means, &cache, x, held_out, &mut responsibilities, &mut outliers,
        );
        let k_final = weights.len();
        return Ok(FullFit {
            params: FullParams {
                weights,
                means,
                covariances,
            },
            responsibilities,
            log_likelihood_train: ll_train,
            log_likelihood_held_out: ll_held,
            iterations: 0,
            k_final,
            outliers,
            num_good_points,
        });
    }

    let total_passes = config.max_iterations.max(1);
    let mut responsibilities = Array2::<f64>::zeros((n, weights.len()));
    let mut outliers = Array1::from_elem(n, false);
    let mut ll_train = 0.0_f64;
    let mut ll_held = 0.0_f64;
    let mut num_good_points = n;
    let mut prev_metric = f64::NEG_INFINITY;
    let mut iters_done: u64 = 0;

    let mut iter = 0u64;
    while iter < total_passes {
        if config.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if weights.is_empty() {
            return Err(Error::AllComponentsBackedOff);
        }

        let cache = build_cache(&covariances)?;
        responsibilities = Array2::<f64>::zeros((n, weights.len()));
        outliers = Array1::from_elem(n, false);
        let (t, h, good) = e_step(
            &weights, &means, &cache, x, held_out, &mut responsibilities, &mut outliers,
        );
        ll_train = t;
        ll_held = h;
        num_good_points = good;

        let acc = accumulate(x, &responsibilities, held_out, &outliers);

        let removed = back_off(&mut weights, &mut means, &mut covariances, &acc.s);
        if removed > 0 {
            for _ in 0..removed {
                log::warn!("removed a mixture component with effective count below {}", BACKOFF_EFFECTIVE_COUNT_THRESHOLD);
            }
            if weights.is_empty() {
                return Err(Error::AllComponentsBackedOff);
            }
            // Restart this iteration with the shrunk component set rather
            // than advancing, per spec §4.1.
            continue;
        }

        let (new_weights, new_means, new_covariances) = finalize_m_step(
            x,
            &responsibilities,
            held_out,
            &outliers,
            &acc,
            config,
            covariance_mask,
        );
        weights = new_weights;
        means = new_means;
        covariances = new_covariances;

        let weight_sum: f64 = weights.sum();
        if (weight_sum - 1.0).abs() > 1e-5 {
            log::warn!(
                "mixing weights sum to {:.6}, expected 1.0 within 1e-5",
                weight_sum
            );
        }

        let metric = if config.em_stop_criterion_held_out_ll && !config.em_stop_criterion_training_ll
        {
            ll_held
        } else {
            ll_train
        };
        let denom = metric.abs() + prev_metric.abs();
        let delta = if denom > 0.0 {
            2.0 * (metric - prev_metric) / denom
        } else {
            0.0
        };
        prev_metric = metric;
        iters_done = iter + 1;
        iter += 1;
        if delta.abs() < config.iteration_tolerance {
            break;
        }
    }

    let k_final = weights.len();
    Ok(FullFit {
        params: FullParams {
            weights,
            means,
            covariances,
        },
        responsibilities,
        log_likelihood_train: ll_train,
        log_likelihood_held_out: ll_held,
        iterations: iters_done,
        k_final,
        outliers,
        num_good_points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand::SeedableRng;
    use rand_isaac::Isaac64Rng;

    fn two_blobs() -> Array2<f64> {
        let mut rng = Isaac64Rng::seed_from_u64(4);
        let mut rows = Vec::new();
        for &(cx, cy) in &[(0.0, 0.0), (12.0, 0.0)] {
            for _ in 0..100 {
                let dx: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                let dy: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                rows.push(vec![cx + dx, cy + dy]);
            }
        }
        Array2::from_shape_vec((200, 2), rows.into_iter().flatten().collect()).unwrap()
    }

    use ndarray_rand::rand::Rng as _;

    #[test]
    fn weights_sum_to_one_and_covariances_stay_full_rank() {
        let x = two_blobs();
        let config = GmmConfig::default();
        let mut rng = Isaac64Rng::seed_from_u64(100);
        let fit = fit_full(&config, 2, x.view(), None, None, None, &mut rng).unwrap();
        assert!((fit.params.weights.sum() - 1.0).abs() < 1e-5);
        for cov in &fit.params.covariances {
            assert!(svd_inverse_and_log_det(cov, 0).is_ok());
        }
    }

    #[test]
    fn back_off_reduces_k_on_excess_components() {
        let x = two_blobs();
        let config = GmmConfig::default();
        let mut rng = Isaac64Rng::seed_from_u64(200);
        let fit = fit_full(&config, 10, x.view(), None, None, None, &mut rng).unwrap();
        assert!(fit.k_final < 10);
        assert_eq!(fit.params.weights.len(), fit.k_final);
    }

    #[test]
    fn covariance_mask_zeroes_out_masked_entries() {
        let x = two_blobs();
        let config = GmmConfig::default();
        let mask = ndarray::array![[1.0, 0.0], [0.0, 1.0]];
        let mut rng = Isaac64Rng::seed_from_u64(300);
        let fit = fit_full(&config, 2, x.view(), None, None, Some(mask.view()), &mut rng).unwrap();
        for cov in &fit.params.covariances {
            assert_eq!(cov[[0, 1]], 0.0);
            assert_eq!(cov[[1, 0]], 0.0);
        }
    }
}
