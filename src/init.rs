//! Random responsibility initialization (spec §4.1, "Initialization").
//!
//! Grounded on `get_independent_GMM_2_with_missing_data`'s `it == 0` branch
//! in the original source: draw a random K-vector scaled down by `20*N`,
//! bump exactly one randomly-chosen component to 1.0 so every component is
//! guaranteed nonzero initial weight, add a single per-point uniform
//! perturbation (`ow_add_scalar_to_vector`: one scalar draw per point,
//! broadcast over the whole row -- not one draw per entry), and normalize
//! to sum 1.

use ndarray::Array2;
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;

pub fn init_responsibilities<R: Rng>(n: usize, k: usize, rng: &mut R) -> Array2<f64> {
    let mut resp = Array2::<f64>::zeros((n, k));
    let unit = Uniform::new(0.0_f64, 1.0);
    let component_pick = Uniform::new(0usize, k);
    let perturbation = Uniform::new(0.0_f64, 0.2 / k as f64);

    for mut row in resp.outer_iter_mut() {
        for v in row.iter_mut() {
            *v = rng.sample(unit) / (20.0 * n as f64);
        }
        let chosen = rng.sample(component_pick);
        row[chosen] = 1.0;

        let sum: f64 = row.sum();
        row.mapv_inplace(|v| v / sum);

        // One scalar per point, added to every entry of its row (mirrors
        // `ow_add_scalar_to_vector`, which perturbs the whole row with a
        // single draw rather than drawing independently per entry).
        let p = rng.sample(perturbation);
        row.mapv_inplace(|v| v + p);
        let sum: f64 = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand_isaac::Isaac64Rng;
    use ndarray_rand::rand::SeedableRng;

    #[test]
    fn every_row_sums_to_one() {
        let mut rng = Isaac64Rng::seed_from_u64(7);
        let resp = init_responsibilities(50, 4, &mut rng);
        for row in resp.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn every_component_gets_nonzero_weight_somewhere() {
        let mut rng = Isaac64Rng::seed_from_u64(11);
        let resp = init_responsibilities(200, 5, &mut rng);
        let totals = resp.sum_axis(ndarray::Axis(0));
        assert!(totals.iter().all(|&t| t > 0.0));
    }
}
