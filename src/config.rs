//! Explicit configuration for the estimator, plus a process-wide option
//! store that exposes the legacy `(option, value)` string setter described
//! in the original C library this crate's algorithms were distilled from.
//!
//! New callers should build a [`GmmConfig`] and pass it explicitly to
//! [`crate::fit`]/[`crate::select`]; [`OptionStore`] exists only so callers
//! migrating from the string-based setter keep working.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A cooperative cancellation signal (spec §5, "Cancellation"). The
/// estimator checks it between iterations; no partial state is ever
/// returned once it observes the flag set. Cloning shares the same
/// underlying flag, so a caller can hold one end and pass the other into
/// `GmmConfig`.
#[derive(Clone)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CancellationToken")
            .field(&self.is_cancelled())
            .finish()
    }
}

/// Cancellation tokens carry no comparable state of their own; two configs
/// that differ only in which token they hold are still "the same
/// configuration" for every purpose `GmmConfig` equality is used for.
impl PartialEq for CancellationToken {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

/// Which criterion the EM loop uses to decide convergence (spec: "Stopping").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCriterion {
    TrainingLogLikelihood,
    HeldOutLogLikelihood,
}

/// Which axis variance values get tied across, if any. At most one tying
/// mode is ever active; when several option flags are set simultaneously
/// the precedence below applies (see DESIGN.md, Open Question #1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TyingMode {
    None,
    /// Replace `v[k, d]` with its mean across components, per feature `d`.
    PerFeature,
    /// Replace every `v[k, d]` with the grand mean across `k` and `d`.
    AllTied,
    /// Replace `v[k, :]` with its own mean, isotropic per cluster.
    PerCluster,
}

/// Explicit, immutable-once-built configuration for a single `fit`/`select`
/// call. Mirrors the option table in spec §6; defaults match the reference
/// implementation's static option defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct GmmConfig {
    pub data_perturbation: Option<f64>,
    pub num_tries_per_cluster_count: usize,
    pub num_cluster_count_samples: usize,
    pub max_iterations: u64,
    pub iteration_tolerance: f64,
    pub normalize_data: bool,
    pub norm_stdev: f64,
    pub var_offset: f64,
    pub use_unbiased_var_estimate_in_m_step: bool,
    pub held_out_data_fraction: f64,
    pub tie_var: bool,
    pub tie_feature_var: bool,
    pub tie_cluster_var: bool,
    pub model_selection_training_mdl: bool,
    pub model_selection_held_out_ll: bool,
    pub model_selection_held_out_mdl: bool,
    pub model_selection_held_out_corr_diff: bool,
    pub model_selection_held_out_max_membership: bool,
    pub em_stop_criterion_training_ll: bool,
    pub em_stop_criterion_held_out_ll: bool,
    pub use_initialized_cluster_means_variances_and_priors: bool,
    pub crop_feature_dimensions: bool,
    pub crop_num_feature_dimensions_left: usize,
    pub crop_num_feature_dimensions_right: usize,
    /// Parsed and round-tripped by the option store but never consulted by
    /// the estimator -- matches the original source, where the symbol is
    /// read by the option parser and never referenced again (see
    /// SPEC_FULL.md §3 and DESIGN.md).
    pub fs_dis_item_prob_threshold: Option<f64>,
    /// Use the legacy `old_bic` penalty (diagonal parameter counts even for
    /// full-covariance models, scaled by `log(N*D)`) instead of the
    /// corrected penalty. Kept only for regression against historical
    /// numeric outputs; see spec §4.3.
    pub use_legacy_bic: bool,
    /// Number of worker threads for the parallel E-step (spec §5). `1`
    /// disables the parallel code path.
    pub num_threads: usize,
    pub missing_value_sentinel: f64,
    /// Cooperative cancellation signal checked between EM iterations (spec
    /// §5). `None` (the default) means the run cannot be cancelled.
    pub cancellation: Option<CancellationToken>,
}

impl Default for GmmConfig {
    fn default() -> Self {
        GmmConfig {
            data_perturbation: None,
            num_tries_per_cluster_count: 1,
            num_cluster_count_samples: 30,
            max_iterations: 20,
            iteration_tolerance: 1.0e-6,
            normalize_data: false,
            norm_stdev: 1.0,
            var_offset: 1.0e-4,
            use_unbiased_var_estimate_in_m_step: false,
            held_out_data_fraction: 0.1,
            tie_var: false,
            tie_feature_var: false,
            tie_cluster_var: false,
            model_selection_training_mdl: false,
            model_selection_held_out_ll: true,
            model_selection_held_out_mdl: false,
            model_selection_held_out_corr_diff: true,
            model_selection_held_out_max_membership: true,
            em_stop_criterion_training_ll: true,
            em_stop_criterion_held_out_ll: false,
            use_initialized_cluster_means_variances_and_priors: false,
            crop_feature_dimensions: false,
            crop_num_feature_dimensions_left: 0,
            crop_num_feature_dimensions_right: 0,
            fs_dis_item_prob_threshold: None,
            use_legacy_bic: false,
            num_threads: 1,
            missing_value_sentinel: f64::NAN,
            cancellation: None,
        }
    }
}

impl GmmConfig {
    /// Resolves the active tying mode from the three mutually-exclusive
    /// flags, first-listed-wins (`tie_var` > `tie_feature_var` >
    /// `tie_cluster_var`). See DESIGN.md, Open Question #1.
    pub fn tying_mode(&self) -> TyingMode {
        if self.tie_var {
            TyingMode::PerFeature
        } else if self.tie_feature_var {
            TyingMode::AllTied
        } else if self.tie_cluster_var {
            TyingMode::PerCluster
        } else {
            TyingMode::None
        }
    }

    /// EM stopping criterion; training log-likelihood wins if both flags
    /// are set, since it is always computed, unlike held-out LL which
    /// requires a non-empty held-out mask.
    pub fn stop_criterion(&self) -> StopCriterion {
        if self.em_stop_criterion_held_out_ll && !self.em_stop_criterion_training_ll {
            StopCriterion::HeldOutLogLikelihood
        } else {
            StopCriterion::TrainingLogLikelihood
        }
    }

    /// Whether a caller-supplied cancellation token has been tripped (spec
    /// §5). Checked by the EM loops between iterations.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .map_or(false, |c| c.is_cancelled())
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_tries_per_cluster_count == 0 || self.num_cluster_count_samples == 0 {
            return Err(Error::InvalidSweepParameters);
        }
        // 0 is a valid, spec-mandated boundary meaning "held-out disabled"
        // (spec §8, "Boundary behavior"); only the upper bound is rejected.
        if !(self.held_out_data_fraction >= 0.0 && self.held_out_data_fraction < 1.0) {
            return Err(Error::InvalidHeldOutFraction(self.held_out_data_fraction));
        }
        Ok(())
    }
}

fn parse_bool(option: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "t" | "true" | "1" | "on" | "yes" => Ok(true),
        "f" | "false" | "0" | "off" | "no" => Ok(false),
        _ => Err(Error::InvalidOptionValue {
            option: option.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_f64(option: &str, value: &str) -> Result<f64> {
    value.parse().map_err(|_| Error::InvalidOptionValue {
        option: option.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(option: &str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| Error::InvalidOptionValue {
        option: option.to_string(),
        value: value.to_string(),
    })
}

fn parse_nonzero_usize(option: &str, value: &str) -> Result<usize> {
    let parsed = parse_usize(option, value)?;
    if parsed == 0 {
        return Err(Error::InvalidOptionValue {
            option: option.to_string(),
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

fn parse_u64(option: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| Error::InvalidOptionValue {
        option: option.to_string(),
        value: value.to_string(),
    })
}

/// The full list of recognized option names, in the order a prefix match
/// prefers them -- earlier entries shadow later ones that share a prefix.
const OPTION_NAMES: &[&str] = &[
    "data_perturbation",
    "num_tries_per_cluster_count",
    "num_cluster_count_samples",
    "max_iterations",
    "iteration_tolerance",
    "normalize_data",
    "norm_stdev",
    "var_offset",
    "use_unbiased_var_estimate_in_m_step",
    "held_out_data_fraction",
    "tie_var",
    "tie_feature_var",
    "tie_cluster_var",
    "model_selection_training_mdl",
    "model_selection_held_out_ll",
    "model_selection_held_out_mdl",
    "model_selection_held_out_corr_diff",
    "model_selection_held_out_max_membership",
    "em_stop_criterion_training_ll",
    "em_stop_criterion_held_out_ll",
    "use_initialized_cluster_means_variances_and_priors",
    "crop_feature_dimensions",
    "crop_num_feature_dimensions_left",
    "crop_num_feature_dimensions_right",
    "fs_dis_item_prob_threshold",
    "use_legacy_bic",
    "num_threads",
];

/// Resolves a (possibly abbreviated) option name to exactly one canonical
/// name, the way the original's prefix-tolerant option parser does. Returns
/// `None` if no known option has this prefix, or if more than one does.
fn resolve_option_name(option: &str) -> Option<&'static str> {
    let canonical = option.to_ascii_lowercase().replace('-', "_");
    let mut matches = OPTION_NAMES
        .iter()
        .copied()
        .filter(|name| name.starts_with(canonical.as_str()));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

/// Result of a single option-setter call, mirroring the original's
/// `NO_ERROR`/printed-string/`NOT_FOUND` behavior.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionOutcome {
    /// `value` was `None` ("print current"): the current value, formatted.
    Printed(String),
    /// `value` was `Some("?")`: an `option = value` assignment string.
    AssignmentForm(String),
    /// The value was parsed and applied.
    Applied,
}

/// Process-wide, option-driven settings store (spec §4.5). Existing callers
/// that still poke at options by name go through here; the store seeds a
/// fresh [`GmmConfig`] for every call to [`OptionStore::snapshot`] rather
/// than being read directly by the estimator, per the "compatibility layer"
/// design note.
pub struct OptionStore {
    inner: Mutex<GmmConfig>,
}

impl Default for OptionStore {
    fn default() -> Self {
        OptionStore {
            inner: Mutex::new(GmmConfig::default()),
        }
    }
}

impl OptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current configuration for use in a `fit` call.
    pub fn snapshot(&self) -> GmmConfig {
        self.inner.lock().unwrap().clone()
    }

    /// The `(option, value)` setter. `value = None` means "print current
    /// value"; `value = Some("?")` means "emit assignment form"; anything
    /// else is parsed as bool/int/float depending on the option. Matching
    /// on `option` is prefix-tolerant: an abbreviation is accepted as long
    /// as it is an unambiguous prefix of exactly one option name.
    pub fn set_em_cluster_option(
        &self,
        option: &str,
        value: Option<&str>,
    ) -> Result<OptionOutcome> {
        let name = resolve_option_name(option).ok_or_else(|| Error::UnknownOption(option.to_string()))?;
        let mut cfg = self.inner.lock().unwrap();

        macro_rules! bool_field {
            ($field:ident) => {{
                match value {
                    None => OptionOutcome::Printed(cfg.$field.to_string()),
                    Some("?") => {
                        OptionOutcome::AssignmentForm(format!("{} = {}", name, cfg.$field))
                    }
                    Some(v) => {
                        cfg.$field = parse_bool(option, v)?;
                        OptionOutcome::Applied
                    }
                }
            }};
        }
        macro_rules! f64_field {
            ($field:ident) => {{
                match value {
                    None => OptionOutcome::Printed(cfg.$field.to_string()),
                    Some("?") => {
                        OptionOutcome::AssignmentForm(format!("{} = {}", name, cfg.$field))
                    }
                    Some(v) => {
                        cfg.$field = parse_f64(option, v)?;
                        OptionOutcome::Applied
                    }
                }
            }};
        }

        let outcome = match name {
            "data_perturbation" => match value {
                None => OptionOutcome::Printed(
                    cfg.data_perturbation
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "unset".to_string()),
                ),
                Some("?") => OptionOutcome::AssignmentForm(format!(
                    "data_perturbation = {}",
                    cfg.data_perturbation
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "unset".to_string())
                )),
                Some(v) => {
                    cfg.data_perturbation = Some(parse_f64(option, v)?);
                    OptionOutcome::Applied
                }
            },
            "fs_dis_item_prob_threshold" => match value {
                None => OptionOutcome::Printed(
                    cfg.fs_dis_item_prob_threshold
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "unset".to_string()),
                ),
                Some("?") => OptionOutcome::AssignmentForm(format!(
                    "fs_dis_item_prob_threshold = {}",
                    cfg.fs_dis_item_prob_threshold
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "unset".to_string())
                )),
                Some(v) => {
                    cfg.fs_dis_item_prob_threshold = Some(parse_f64(option, v)?);
                    OptionOutcome::Applied
                }
            },
            "num_tries_per_cluster_count" => match value {
                None => OptionOutcome::Printed(cfg.num_tries_per_cluster_count.to_string()),
                Some("?") => OptionOutcome::AssignmentForm(format!(
                    "num_tries_per_cluster_count = {}",
                    cfg.num_tries_per_cluster_count
                )),
                Some(v) => {
                    cfg.num_tries_per_cluster_count = parse_nonzero_usize(option, v)?;
                    OptionOutcome::Applied
                }
            },
            "num_cluster_count_samples" => match value {
                None => OptionOutcome::Printed(cfg.num_cluster_count_samples.to_string()),
                Some("?") => OptionOutcome::AssignmentForm(format!(
                    "num_cluster_count_samples = {}",
                    cfg.num_cluster_count_samples
                )),
                Some(v) => {
                    cfg.num_cluster_count_samples = parse_nonzero_usize(option, v)?;
                    OptionOutcome::Applied
                }
            },
            "max_iterations" => match value {
                None => OptionOutcome::Printed(cfg.max_iterations.to_string()),
                Some("?") => {
                    OptionOutcome::AssignmentForm(format!("max_iterations = {}", cfg.max_iterations))
                }
                Some(v) => {
                    cfg.max_iterations = parse_u64(option, v)?;
                    OptionOutcome::Applied
                }
            },
            "iteration_tolerance" => f64_field!(iteration_tolerance),
            "normalize_data" => bool_field!(normalize_data),
            "norm_stdev" => f64_field!(norm_stdev),
            "var_offset" => f64_field!(var_offset),
            "use_unbiased_var_estimate_in_m_step" => bool_field!(use_unbiased_var_estimate_in_m_step),
            "held_out_data_fraction" => f64_field!(held_out_data_fraction),
            "tie_var" => bool_field!(tie_var),
            "tie_feature_var" => bool_field!(tie_feature_var),
            "tie_cluster_var" => bool_field!(tie_cluster_var),
            "model_selection_training_mdl" => bool_field!(model_selection_training_mdl),
            "model_selection_held_out_ll" => bool_field!(model_selection_held_out_ll),
            "model_selection_held_out_mdl" => bool_field!(model_selection_held_out_mdl),
            "model_selection_held_out_corr_diff" => bool_field!(model_selection_held_out_corr_diff),
            "model_selection_held_out_max_membership" => {
                bool_field!(model_selection_held_out_max_membership)
            }
            "em_stop_criterion_training_ll" => bool_field!(em_stop_criterion_training_ll),
            "em_stop_criterion_held_out_ll" => bool_field!(em_stop_criterion_held_out_ll),
            "use_initialized_cluster_means_variances_and_priors" => {
                bool_field!(use_initialized_cluster_means_variances_and_priors)
            }
            "crop_feature_dimensions" => bool_field!(crop_feature_dimensions),
            "crop_num_feature_dimensions_left" => match value {
                None => OptionOutcome::Printed(cfg.crop_num_feature_dimensions_left.to_string()),
                Some("?") => OptionOutcome::AssignmentForm(format!(
                    "crop_num_feature_dimensions_left = {}",
                    cfg.crop_num_feature_dimensions_left
                )),
                Some(v) => {
                    cfg.crop_num_feature_dimensions_left = parse_usize(option, v)?;
                    OptionOutcome::Applied
                }
            },
            "crop_num_feature_dimensions_right" => match value {
                None => OptionOutcome::Printed(cfg.crop_num_feature_dimensions_right.to_string()),
                Some("?") => OptionOutcome::AssignmentForm(format!(
                    "crop_num_feature_dimensions_right = {}",
                    cfg.crop_num_feature_dimensions_right
                )),
                Some(v) => {
                    cfg.crop_num_feature_dimensions_right = parse_usize(option, v)?;
                    OptionOutcome::Applied
                }
            },
            "use_legacy_bic" => bool_field!(use_legacy_bic),
            "num_threads" => match value {
                None => OptionOutcome::Printed(cfg.num_threads.to_string()),
                Some("?") => OptionOutcome::AssignmentForm(format!("num_threads = {}", cfg.num_threads)),
                Some(v) => {
                    cfg.num_threads = parse_nonzero_usize(option, v)?;
                    OptionOutcome::Applied
                }
            },
            _ => unreachable!("resolve_option_name only returns names in OPTION_NAMES"),
        };
        Ok(outcome)
    }
}
