//! Variance tying: constraining diagonal variances to be equal across a
//! chosen axis after the per-component, per-feature M-step update (spec
//! §4.1). Full covariance has no tying support (spec §4.2).

use crate::config::TyingMode;
use ndarray::{Array2, Axis};

/// Applies `mode` to `variances` (K x D) in place. The three modes are
/// mutually exclusive; [`crate::config::GmmConfig::tying_mode`] has
/// already resolved precedence before this is called.
pub fn apply_tying(variances: &mut Array2<f64>, mode: TyingMode) {
    match mode {
        TyingMode::None => {}
        TyingMode::PerFeature => {
            let per_feature_mean = variances
                .mean_axis(Axis(0))
                .expect("variances has at least one row");
            for mut row in variances.axis_iter_mut(Axis(0)) {
                row.assign(&per_feature_mean);
            }
        }
        TyingMode::AllTied => {
            let grand_mean = variances.mean().expect("variances is non-empty");
            variances.fill(grand_mean);
        }
        TyingMode::PerCluster => {
            for mut row in variances.axis_iter_mut(Axis(0)) {
                let cluster_mean = row.mean().expect("row has at least one feature");
                row.fill(cluster_mean);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn per_feature_ties_across_components() {
        let mut v = array![[1.0, 10.0], [3.0, 20.0]];
        apply_tying(&mut v, TyingMode::PerFeature);
        assert_abs_diff_eq!(v[[0, 0]], 2.0);
        assert_abs_diff_eq!(v[[1, 0]], 2.0);
        assert_abs_diff_eq!(v[[0, 1]], 15.0);
        assert_abs_diff_eq!(v[[1, 1]], 15.0);
    }

    #[test]
    fn all_tied_uses_the_grand_mean() {
        let mut v = array![[1.0, 3.0], [5.0, 7.0]];
        apply_tying(&mut v, TyingMode::AllTied);
        assert_abs_diff_eq!(v[[0, 0]], 4.0);
        assert_abs_diff_eq!(v[[1, 1]], 4.0);
    }

    #[test]
    fn per_cluster_is_isotropic_within_a_row() {
        let mut v = array![[1.0, 3.0], [10.0, 20.0]];
        apply_tying(&mut v, TyingMode::PerCluster);
        assert_abs_diff_eq!(v[[0, 0]], 2.0);
        assert_abs_diff_eq!(v[[0, 1]], 2.0);
        assert_abs_diff_eq!(v[[1, 0]], 15.0);
        assert_abs_diff_eq!(v[[1, 1]], 15.0);
    }
}
