//! Model-selection controller (spec §4.3): sweeps a geometric grid of
//! candidate component counts, scores each candidate fit under one of five
//! criteria, and retrains the winner on the full dataset.

use crate::bic;
use crate::config::GmmConfig;
use crate::diag::{fit_diag, DiagParams};
use crate::error::{Error, Result};
use crate::full::{fit_full, FullParams};
use crate::CovarianceKind;
use ndarray::{Array1, Array2, ArrayView2};
use ndarray_rand::rand::Rng;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum SelectedParams {
    Diagonal(DiagParams),
    Full(FullParams),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionResult {
    pub k: usize,
    pub params: SelectedParams,
    pub responsibilities: Array2<f64>,
    pub log_likelihood_train: f64,
    pub log_likelihood_held_out: f64,
    /// Set when the training-MDL early-termination rule cut the sweep
    /// short (spec §4.3, "Early termination").
    pub sweep_aborted_early: bool,
    /// Per-`K` early-termination bookkeeping (SPEC_FULL.md §3): the original
    /// only surfaces this via `verbose_pso` logging. Exposing it lets a
    /// caller tell *why* the sweep stopped early, not just that it did.
    pub per_k: Vec<KDiagnostic>,
}

/// Early-termination bookkeeping recorded for one candidate `K` during a
/// training-MDL sweep (spec §4.3, "Early termination"). `slightly_below_best`
/// counts runs at this `K` whose adjusted likelihood fell to within the
/// "slightly below" band (<=95% of the best score seen so far, sign-aware);
/// `downward_trend` is set on the `K` whose run crossed the stricter 80%
/// threshold and triggered the abort.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KDiagnostic {
    pub k: usize,
    pub runs: usize,
    pub mean_score: f64,
    pub slightly_below_best: usize,
    pub downward_trend: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScoreMode {
    TrainingMdl,
    HeldOutLl,
    HeldOutMdl,
    CorrDiff,
    MaxMembership,
}

/// Resolves which of the five (non-mutually-exclusive, per the config's
/// defaults) scoring flags actually drives winner selection. Declaration
/// order in [`GmmConfig`] is the precedence, the same convention used for
/// variance tying (see DESIGN.md).
fn primary_score_mode(config: &GmmConfig) -> ScoreMode {
    if config.model_selection_training_mdl {
        ScoreMode::TrainingMdl
    } else if config.model_selection_held_out_ll {
        ScoreMode::HeldOutLl
    } else if config.model_selection_held_out_mdl {
        ScoreMode::HeldOutMdl
    } else if config.model_selection_held_out_corr_diff {
        ScoreMode::CorrDiff
    } else {
        ScoreMode::MaxMembership
    }
}

fn geometric_grid(k_max: usize, samples: usize) -> Vec<usize> {
    let samples = samples.max(1);
    if k_max < 2 {
        return vec![k_max.max(1)];
    }
    let log_min = 2.0_f64.ln();
    let log_max = (k_max as f64).ln();
    let mut grid = Vec::with_capacity(samples);
    for i in 0..samples {
        let t = if samples == 1 {
            0.0
        } else {
            i as f64 / (samples - 1) as f64
        };
        let log_k = log_min + t * (log_max - log_min);
        let k = (log_k.exp().round() as usize).clamp(2, k_max);
        grid.push(k);
    }
    grid.dedup();
    grid
}

fn sample_held_out_mask<R: Rng>(n: usize, fraction: f64, rng: &mut R) -> Array1<bool> {
    let num_held = ((n as f64) * fraction).floor() as usize;
    let mut mask = Array1::from_elem(n, false);
    let mut chosen = std::collections::HashSet::new();
    while chosen.len() < num_held.min(n) {
        chosen.insert(rng.gen_range(0..n));
    }
    for idx in chosen {
        mask[idx] = true;
    }
    mask
}

/// Sign-aware fraction threshold used by the training-MDL early-termination
/// rule: `fraction` of `best`, correctly oriented whether `best` is
/// positive or negative.
fn sign_aware_threshold(best: f64, fraction: f64) -> f64 {
    if best >= 0.0 {
        best * fraction
    } else {
        best / fraction
    }
}

fn normalize_l2(row: ndarray::ArrayView1<f64>) -> Array1<f64> {
    let norm = row.dot(&row).sqrt();
    if norm > 0.0 {
        row.mapv(|v| v / norm)
    } else {
        row.to_owned()
    }
}

/// Held-out correlation-difference stability score (spec §4.3): the mean,
/// over held-out points, of the squared Euclidean distance between the
/// L2-normalized responsibility vector of the held-out-trained model and
/// that of a reference model trained on the full data at the same K. Lower
/// is better. Assumes both models' components are in comparable order
/// (both were initialized from the same RNG stream; see DESIGN.md).
fn correlation_diff_score(
    candidate_resp: &Array2<f64>,
    reference_resp: &Array2<f64>,
    held_out: &Array1<bool>,
) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for i in 0..candidate_resp.nrows() {
        if !held_out[i] {
            continue;
        }
        let a = normalize_l2(candidate_resp.row(i));
        let b = normalize_l2(reference_resp.row(i));
        let diff = &a - &b;
        total += diff.dot(&diff);
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

fn max_membership_score(responsibilities: &Array2<f64>, held_out: &Array1<bool>) -> f64 {
    let mut total = 0.0;
    for i in 0..responsibilities.nrows() {
        if !held_out[i] {
            continue;
        }
        let row_max = responsibilities
            .row(i)
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        total += row_max;
    }
    total
}

struct Candidate {
    params: SelectedParams,
    responsibilities: Array2<f64>,
    ll_train: f64,
    ll_held: f64,
    iterations: u64,
    k_actual: usize,
}

fn fit_candidate<R: Rng>(
    config: &GmmConfig,
    k: usize,
    x: ArrayView2<f64>,
    held_out: Option<&Array1<bool>>,
    covariance: CovarianceKind,
    covariance_mask: Option<ArrayView2<f64>>,
    max_iterations_override: Option<u64>,
    rng: &mut R,
) -> Result<Candidate> {
    let mut local_config = config.clone();
    local_config.use_initialized_cluster_means_variances_and_priors = false;
    if let Some(m) = max_iterations_override {
        local_config.max_iterations = m;
    }

    match covariance {
        CovarianceKind::Diagonal => {
            let fit = fit_diag(&local_config, k, x, held_out, None, rng)?;
            Ok(Candidate {
                params: SelectedParams::Diagonal(fit.params),
                responsibilities: fit.responsibilities,
                ll_train: fit.log_likelihood_train,
                ll_held: fit.log_likelihood_held_out,
                iterations: fit.iterations,
                k_actual: k,
            })
        }
        CovarianceKind::Full => {
            let fit = fit_full(&local_config, k, x, held_out, None, covariance_mask, rng)?;
            Ok(Candidate {
                params: SelectedParams::Full(fit.params),
                responsibilities: fit.responsibilities,
                ll_train: fit.log_likelihood_train,
                ll_held: fit.log_likelihood_held_out,
                iterations: fit.iterations,
                k_actual: fit.k_final,
            })
        }
    }
}

/// Sweeps `k` from 2 to `k_max` on a geometric grid of
/// `config.num_cluster_count_samples` points, scores every restart, and
/// retrains the winning component count on the full dataset (spec §4.3).
pub fn select<R: Rng>(
    config: &GmmConfig,
    k_max: usize,
    x: ArrayView2<f64>,
    covariance: CovarianceKind,
    covariance_mask: Option<ArrayView2<f64>>,
    rng: &mut R,
) -> Result<SelectionResult> {
    config.validate()?;
    if k_max < 2 {
        return Err(Error::InvalidClusterCount(k_max));
    }
    let (n, d) = x.dim();
    if n < 1 || d < 1 {
        return Err(Error::EmptyData { rows: n, cols: d });
    }

    let mode = primary_score_mode(config);
    let grid = geometric_grid(k_max, config.num_cluster_count_samples);

    struct RunRecord {
        k: usize,
        score: f64,
        candidate: Candidate,
    }

    let mut records: Vec<RunRecord> = Vec::new();
    let mut reference_cache: HashMap<usize, Candidate> = HashMap::new();
    let mut best_overall_score = f64::NEG_INFINITY;
    let mut low_score_run_count = 0usize;
    let mut aborted = false;
    let mut per_k: Vec<KDiagnostic> = Vec::new();

    'sweep: for &k in &grid {
        let mut k_runs = 0usize;
        let mut k_score_sum = 0.0_f64;
        let mut k_slightly_below = 0usize;
        let mut k_downward_trend = false;

        for _try in 0..config.num_tries_per_cluster_count {
            let held_out_mask = sample_held_out_mask(n, config.held_out_data_fraction, rng);
            let candidate = fit_candidate(
                config,
                k,
                x,
                Some(&held_out_mask),
                covariance,
                covariance_mask,
                None,
                rng,
            )?;

            let score = match mode {
                ScoreMode::TrainingMdl => {
                    let n_train = held_out_mask.iter().filter(|&&h| !h).count().max(1);
                    candidate.ll_train
                        - bic::penalty(
                            candidate.k_actual,
                            d,
                            n_train,
                            covariance,
                            config.tying_mode(),
                            config.use_legacy_bic,
                        )
                }
                ScoreMode::HeldOutLl => candidate.ll_held,
                ScoreMode::HeldOutMdl => {
                    let n_held = held_out_mask.iter().filter(|&&h| h).count().max(1);
                    candidate.ll_held
                        - bic::penalty(
                            candidate.k_actual,
                            d,
                            n_held,
                            covariance,
                            config.tying_mode(),
                            config.use_legacy_bic,
                        )
                }
                ScoreMode::CorrDiff => {
                    if !reference_cache.contains_key(&k) {
                        let reference =
                            fit_candidate(config, k, x, None, covariance, covariance_mask, None, rng)?;
                        reference_cache.insert(k, reference);
                    }
                    let reference = reference_cache.get(&k).unwrap();
                    correlation_diff_score(
                        &candidate.responsibilities,
                        &reference.responsibilities,
                        &held_out_mask,
                    )
                }
                ScoreMode::MaxMembership => {
                    max_membership_score(&candidate.responsibilities, &held_out_mask)
                }
            };

            k_runs += 1;
            k_score_sum += score;

            if mode == ScoreMode::TrainingMdl {
                if score > best_overall_score {
                    best_overall_score = score;
                    low_score_run_count = 0;
                } else {
                    let threshold_95 = sign_aware_threshold(best_overall_score, 0.95);
                    if score < threshold_95 {
                        low_score_run_count += 1;
                        k_slightly_below += 1;
                        if low_score_run_count > config.num_tries_per_cluster_count + 1 {
                            let threshold_80 = sign_aware_threshold(best_overall_score, 0.80);
                            if score <= threshold_80 {
                                aborted = true;
                                k_downward_trend = true;
                            }
                        }
                    }
                }
            }

            records.push(RunRecord { k, score, candidate });

            if aborted {
                break;
            }
        }

        per_k.push(KDiagnostic {
            k,
            runs: k_runs,
            mean_score: if k_runs > 0 { k_score_sum / k_runs as f64 } else { 0.0 },
            slightly_below_best: k_slightly_below,
            downward_trend: k_downward_trend,
        });

        if aborted {
            break 'sweep;
        }
    }

    let minimize = mode == ScoreMode::CorrDiff;
    let mut sums: HashMap<usize, f64> = HashMap::new();
    for r in &records {
        *sums.entry(r.k).or_insert(0.0) += r.score;
    }

    let winning_k = sums
        .into_iter()
        .fold(None, |acc: Option<(usize, f64)>, (k, s)| match acc {
            None => Some((k, s)),
            Some((bk, bs)) => {
                let better = if minimize { s < bs } else { s > bs };
                if better {
                    Some((k, s))
                } else {
                    Some((bk, bs))
                }
            }
        })
        .map(|(k, _)| k)
        .ok_or(Error::InvalidSweepParameters)?;

    let best_run = records
        .iter()
        .filter(|r| r.k == winning_k)
        .fold(None, |acc: Option<&RunRecord>, r| match acc {
            None => Some(r),
            Some(best) => {
                let better = if minimize {
                    r.score < best.score
                } else {
                    r.score > best.score
                };
                if better {
                    Some(r)
                } else {
                    Some(best)
                }
            }
        })
        .expect("winning_k has at least one recorded run");

    let g = best_run.candidate.iterations;

    // Retrain on the full dataset, K fixed, iteration cap g. Mode-agnostic:
    // the max-membership scoring mode's retrain step is unspecified in the
    // original source, so it falls back to this same procedure (spec §9,
    // Open Question #1; see DESIGN.md).
    let retrained = fit_candidate(config, winning_k, x, None, covariance, covariance_mask, Some(g), rng)?;

    Ok(SelectionResult {
        k: winning_k,
        params: retrained.params,
        responsibilities: retrained.responsibilities,
        log_likelihood_train: retrained.ll_train,
        log_likelihood_held_out: retrained.ll_held,
        sweep_aborted_early: aborted,
        per_k,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand::Rng as _;
    use ndarray_rand::rand::SeedableRng;
    use rand_isaac::Isaac64Rng;

    #[test]
    fn geometric_grid_stays_within_bounds_and_sorted() {
        let grid = geometric_grid(8, 5);
        assert!(grid.iter().all(|&k| (2..=8).contains(&k)));
        assert!(grid.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn k_max_below_two_is_rejected() {
        let config = GmmConfig::default();
        let x = ndarray::array![[0.0, 0.0], [1.0, 1.0]];
        let mut rng = Isaac64Rng::seed_from_u64(1);
        assert!(matches!(
            select(&config, 1, x.view(), CovarianceKind::Diagonal, None, &mut rng),
            Err(Error::InvalidClusterCount(1))
        ));
    }

    #[test]
    fn selects_a_plausible_k_for_a_four_component_mixture() {
        let mut rng = Isaac64Rng::seed_from_u64(77);
        let mut rows = Vec::new();
        for &(cx, cy) in &[(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0)] {
            for _ in 0..80 {
                let dx: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                let dy: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                rows.push(vec![cx + dx, cy + dy]);
            }
        }
        let x = Array2::from_shape_vec((320, 2), rows.into_iter().flatten().collect()).unwrap();

        let mut config = GmmConfig::default();
        config.num_cluster_count_samples = 6;
        config.num_tries_per_cluster_count = 1;
        config.max_iterations = 10;

        let mut select_rng = Isaac64Rng::seed_from_u64(78);
        let result = select(
            &config,
            8,
            x.view(),
            CovarianceKind::Diagonal,
            None,
            &mut select_rng,
        )
        .unwrap();
        assert!(result.k >= 2 && result.k <= 8);
        if let SelectedParams::Diagonal(p) = &result.params {
            assert_eq!(p.n_clusters(), result.k);
        } else {
            panic!("expected diagonal params");
        }
    }

    #[test]
    fn per_k_diagnostics_cover_every_sampled_k_when_the_sweep_runs_to_completion() {
        let mut rng = Isaac64Rng::seed_from_u64(88);
        let mut rows = Vec::new();
        for &(cx, cy) in &[(0.0, 0.0), (10.0, 0.0)] {
            for _ in 0..60 {
                let dx: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                let dy: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                rows.push(vec![cx + dx, cy + dy]);
            }
        }
        let x = Array2::from_shape_vec((120, 2), rows.into_iter().flatten().collect()).unwrap();

        let mut config = GmmConfig::default();
        config.model_selection_training_mdl = true;
        config.model_selection_held_out_ll = false;
        config.model_selection_held_out_corr_diff = false;
        config.model_selection_held_out_max_membership = false;
        config.num_cluster_count_samples = 4;
        config.num_tries_per_cluster_count = 1;
        config.max_iterations = 5;

        let mut select_rng = Isaac64Rng::seed_from_u64(89);
        let result = select(
            &config,
            6,
            x.view(),
            CovarianceKind::Diagonal,
            None,
            &mut select_rng,
        )
        .unwrap();

        assert!(!result.per_k.is_empty());
        for diag in &result.per_k {
            assert!(diag.runs >= 1);
            assert!((2..=6).contains(&diag.k));
        }
        if result.sweep_aborted_early {
            assert!(result.per_k.iter().any(|d| d.downward_trend));
        }
    }
}
