//! End-to-end scenarios against the public API, one per scenario in the
//! requirements this crate implements.

use approx::assert_abs_diff_eq;
use gmm_em::{fit_diag, fit_full, select, CovarianceKind, GmmConfig, SelectedParams};
use ndarray::{Array1, Array2};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use rand_isaac::Isaac64Rng;

fn isotropic_blobs(centers: &[(f64, f64)], per_cluster: usize, seed: u64) -> Array2<f64> {
    let mut rng = Isaac64Rng::seed_from_u64(seed);
    let mut rows = Vec::with_capacity(centers.len() * per_cluster * 2);
    for &(cx, cy) in centers {
        for _ in 0..per_cluster {
            let dx: f64 = rng.sample(StandardNormal);
            let dy: f64 = rng.sample(StandardNormal);
            rows.push(cx + dx);
            rows.push(cy + dy);
        }
    }
    Array2::from_shape_vec((centers.len() * per_cluster, 2), rows).unwrap()
}

#[test]
fn well_separated_clusters_are_recovered() {
    let centers = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)];
    let x = isotropic_blobs(&centers, 300, 1);
    let config = GmmConfig::default();
    let mut rng = Isaac64Rng::seed_from_u64(2);
    let fit = fit_diag(&config, 3, x.view(), None, None, &mut rng).unwrap();

    for &w in fit.params.weights.iter() {
        assert!((0.15..=0.55).contains(&w), "weight {w} out of expected range");
    }
    for row in fit.params.means.outer_iter() {
        let closest = centers
            .iter()
            .map(|&(cx, cy)| ((row[0] - cx).powi(2) + (row[1] - cy).powi(2)).sqrt())
            .fold(f64::INFINITY, f64::min);
        assert!(closest < 2.0, "recovered mean too far from every true center");
    }
}

#[test]
fn tied_variance_is_recovered_across_components() {
    let mut rng = Isaac64Rng::seed_from_u64(3);
    let mut rows = Vec::new();
    for &cx in &[0.0, 15.0] {
        for _ in 0..250 {
            let dx: f64 = rng.sample::<f64, _>(StandardNormal) * 2.0;
            let dy: f64 = rng.sample::<f64, _>(StandardNormal) * 2.0;
            rows.push(cx + dx);
            rows.push(dy);
        }
    }
    let x = Array2::from_shape_vec((500, 2), rows).unwrap();

    let mut config = GmmConfig::default();
    config.tie_var = true;
    let mut fit_rng = Isaac64Rng::seed_from_u64(4);
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
fn held_out_model_selection_favors_a_plausible_k() {
    let centers = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0)];
    let x = isotropic_blobs(&centers, 60, 5);

    let mut config = GmmConfig::default();
    config.num_cluster_count_samples = 6;
    config.num_tries_per_cluster_count = 1;
    config.max_iterations = 10;

    let mut rng = Isaac64Rng::seed_from_u64(6);
    let result = select(&config, 8, x.view(), CovarianceKind::Diagonal, None, &mut rng).unwrap();

    assert!((2..=8).contains(&result.k));
    if let SelectedParams::Diagonal(p) = &result.params {
        assert_eq!(p.n_clusters(), result.k);
    } else {
        panic!("expected a diagonal result from a diagonal sweep");
    }
}

#[test]
fn missing_data_still_recovers_reasonable_means() {
    let centers = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)];
    let mut x = isotropic_blobs(&centers, 150, 7);
    let mut rng = Isaac64Rng::seed_from_u64(8);
    for v in x.iter_mut() {
        if rng.gen::<f64>() < 0.2 {
            *v = f64::NAN;
        }
    }

    let config = GmmConfig::default();
    let mut fit_rng = Isaac64Rng::seed_from_u64(9);
    let fit = fit_diag(&config, 3, x.view(), None, None, &mut fit_rng).unwrap();

    for row in fit.params.means.outer_iter() {
        let closest = centers
            .iter()
            .map(|&(cx, cy)| ((row[0] - cx).powi(2) + (row[1] - cy).powi(2)).sqrt())
            .fold(f64::INFINITY, f64::min);
        assert!(closest < 2.0, "recovered mean strayed too far under missingness");
    }
}

#[test]
fn full_covariance_back_off_shrinks_an_over_specified_k() {
    let x = isotropic_blobs(&[(0.0, 0.0), (12.0, 0.0)], 100, 10);
    let config = GmmConfig::default();
    let mut rng = Isaac64Rng::seed_from_u64(11);
    let fit = fit_full(&config, 10, x.view(), None, None, None, &mut rng).unwrap();

    assert!(fit.k_final < 10);
    assert_eq!(fit.params.weights.len(), fit.k_final);
    assert_eq!(fit.params.covariances.len(), fit.k_final);
}

#[test]
fn determinism_under_single_vs_multi_threaded_e_step() {
    let x = isotropic_blobs(&[(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)], 80, 12);

    let mut config_one = GmmConfig::default();
    config_one.num_threads = 1;
    config_one.max_iterations = 8;
    let mut config_four = config_one.clone();
    config_four.num_threads = 4;

    let mut rng_one = Isaac64Rng::seed_from_u64(13);
    let fit_one = fit_diag(&config_one, 3, x.view(), None, None, &mut rng_one).unwrap();

    let mut rng_four = Isaac64Rng::seed_from_u64(13);
    let fit_four = fit_diag(&config_four, 3, x.view(), None, None, &mut rng_four).unwrap();

    assert_abs_diff_eq!(
        fit_one.log_likelihood_train,
        fit_four.log_likelihood_train,
        epsilon = 1e-8
    );
}

#[test]
fn k_equals_one_recovers_the_sample_mean() {
    let x = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let config = GmmConfig::default();
    let mut rng = Isaac64Rng::seed_from_u64(14);
    let fit = fit_diag(&config, 1, x.view(), None, None, &mut rng).unwrap();

    assert_abs_diff_eq!(fit.params.weights[0], 1.0, epsilon = 1e-10);
    let mean = x.mean_axis(ndarray::Axis(0)).unwrap();
    assert_abs_diff_eq!(fit.params.means[[0, 0]], mean[0], epsilon = 1e-6);
    assert_abs_diff_eq!(fit.params.means[[0, 1]], mean[1], epsilon = 1e-6);
}

#[test]
fn held_out_fraction_of_one_is_rejected() {
    let x = Array2::from_shape_vec((4, 2), vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]).unwrap();
    let mut config = GmmConfig::default();
    config.held_out_data_fraction = 1.0;
    let mut rng = Isaac64Rng::seed_from_u64(15);
    let held_out = Array1::from(vec![true, true, true, true]);
    let result = fit_diag(&config, 2, x.view(), Some(&held_out), None, &mut rng);
    assert!(result.is_err());
}
