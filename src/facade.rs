//! Public façade (spec §4.4): wraps the single-fit and model-selection
//! entry points with the caller-facing preprocessing steps -- feature-column
//! cropping, additive perturbation, and per-feature whitening -- so `X` and
//! its derived parameters always travel in the caller's original feature
//! space once `fit` returns.

use crate::config::GmmConfig;
use crate::diag::{DiagFit, DiagParams};
use crate::error::Result;
use crate::full::{FullFit, FullParams};
use crate::selection::{SelectedParams, SelectionResult};
use crate::CovarianceKind;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;

/// What the caller wants `fit` to run, after preprocessing.
pub enum FitTarget {
    Diag {
        k: usize,
        held_out: Option<Array1<bool>>,
        warm_start: Option<DiagParams>,
    },
    Full {
        k: usize,
        held_out: Option<Array1<bool>>,
        warm_start: Option<FullParams>,
        covariance_mask: Option<Array2<f64>>,
    },
    Select {
        k_max: usize,
        covariance: CovarianceKind,
        covariance_mask: Option<Array2<f64>>,
    },
}

pub enum FitOutput {
    Diag(DiagFit),
    Full(FullFit),
    Select(SelectionResult),
}

/// Crops `crop_num_feature_dimensions_left` columns from the left and
/// `crop_num_feature_dimensions_right` from the right, if
/// `config.crop_feature_dimensions` is set. Applied before any other
/// preprocessing (spec §4.4 design note: "feature-column cropping...
/// applied first").
fn apply_crop(config: &GmmConfig, x: ArrayView2<f64>) -> Array2<f64> {
    if !config.crop_feature_dimensions {
        return x.to_owned();
    }
    let d = x.ncols();
    let left = config.crop_num_feature_dimensions_left.min(d);
    let right = config.crop_num_feature_dimensions_right.min(d - left);
    x.slice(ndarray::s![.., left..d - right]).to_owned()
}

fn apply_perturbation<R: Rng>(config: &GmmConfig, x: &mut Array2<f64>, rng: &mut R) {
    let magnitude = match config.data_perturbation {
        Some(m) if m > 0.0 => m,
        _ => return,
    };
    let dist = Uniform::new(-magnitude / 2.0, magnitude / 2.0);
    for v in x.iter_mut() {
        if !v.is_nan() {
            *v += rng.sample(dist);
        }
    }
}

/// Per-feature (mean, variance) ignoring missing entries.
struct ColumnStats {
    mean: Array1<f64>,
    variance: Array1<f64>,
}

fn column_stats(x: &Array2<f64>) -> ColumnStats {
    let d = x.ncols();
    let mut mean = Array1::<f64>::zeros(d);
    let mut variance = Array1::<f64>::zeros(d);
    for j in 0..d {
        let observed: Vec<f64> = x.column(j).iter().cloned().filter(|v| !v.is_nan()).collect();
        let n = (observed.len().max(1)) as f64;
        let m = observed.iter().sum::<f64>() / n;
        let v = observed.iter().map(|&xi| (xi - m) * (xi - m)).sum::<f64>() / n;
        mean[j] = m;
        variance[j] = v;
    }
    ColumnStats { mean, variance }
}

/// Per-feature whitening scale factors: `scale[j] = sqrt(norm_stdev) /
/// stdev[j]`, so that `(x - mean) * scale` has variance `norm_stdev`.
struct Whitening {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

fn apply_whitening(config: &GmmConfig, x: &mut Array2<f64>) -> Option<Whitening> {
    if !config.normalize_data {
        return None;
    }
    let stats = column_stats(x);
    let target_stdev = config.norm_stdev.max(f64::MIN_POSITIVE).sqrt();
    let scale = stats.variance.mapv(|v| target_stdev / v.sqrt().max(f64::MIN_POSITIVE));

    let d = x.ncols();
    for j in 0..d {
        let mean_j = stats.mean[j];
        let scale_j = scale[j];
        for v in x.column_mut(j).iter_mut() {
            if !v.is_nan() {
                *v = (*v - mean_j) * scale_j;
            }
        }
    }

    Some(Whitening {
        mean: stats.mean,
        scale,
    })
}

fn unwhiten_diag(params: &mut DiagParams, whitening: &Whitening) {
    let d = params.n_features();
    for k in 0..params.n_clusters() {
        for j in 0..d {
            let scale_j = whitening.scale[j];
            params.means[[k, j]] = params.means[[k, j]] / scale_j + whitening.mean[j];
            params.variances[[k, j]] /= scale_j * scale_j;
        }
    }
}

fn unwhiten_full(params: &mut FullParams, whitening: &Whitening) {
    let d = params.n_features();
    for k in 0..params.n_clusters() {
        for j in 0..d {
            let scale_j = whitening.scale[j];
            params.means[[k, j]] = params.means[[k, j]] / scale_j + whitening.mean[j];
        }
        for i in 0..d {
            for j in 0..d {
                params.covariances[k][[i, j]] /= whitening.scale[i] * whitening.scale[j];
            }
        }
    }
}

/// Entry point wrapping §4.1/§4.2/§4.3: crop, perturb, whiten, dispatch to
/// the requested [`FitTarget`], then un-whiten the returned parameters back
/// into the caller's original feature space.
pub fn fit<R: Rng>(config: &GmmConfig, x: ArrayView2<f64>, target: FitTarget, rng: &mut R) -> Result<FitOutput> {
    let mut x = apply_crop(config, x);
    crate::data::normalize_sentinel(&mut x, config.missing_value_sentinel);
    apply_perturbation(config, &mut x, rng);
    let whitening = apply_whitening(config, &mut x);

    let mut output = match target {
        FitTarget::Diag {
            k,
            held_out,
            warm_start,
        } => FitOutput::Diag(crate::diag::fit_diag(
            config,
            k,
            x.view(),
            held_out.as_ref(),
            warm_start.as_ref(),
            rng,
        )?),
        FitTarget::Full {
            k,
            held_out,
            warm_start,
            covariance_mask,
        } => FitOutput::Full(crate::full::fit_full(
            config,
            k,
            x.view(),
            held_out.as_ref(),
            warm_start.as_ref(),
            covariance_mask.as_ref().map(|m| m.view()),
            rng,
        )?),
        FitTarget::Select {
            k_max,
            covariance,
            covariance_mask,
        } => FitOutput::Select(crate::selection::select(
            config,
            k_max,
            x.view(),
            covariance,
            covariance_mask.as_ref().map(|m| m.view()),
            rng,
        )?),
    };

    if let Some(whitening) = &whitening {
        match &mut output {
            FitOutput::Diag(fit) => unwhiten_diag(&mut fit.params, whitening),
            FitOutput::Full(fit) => unwhiten_full(&mut fit.params, whitening),
            FitOutput::Select(result) => match &mut result.params {
                SelectedParams::Diagonal(p) => unwhiten_diag(p, whitening),
                SelectedParams::Full(p) => unwhiten_full(p, whitening),
            },
        }
    }

    Ok(output)
}
