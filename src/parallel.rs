//! Data-parallel E-step for the diagonal-covariance estimator (spec §5,
//! "Parallel E-step"). Used by [`crate::diag::fit_diag`] whenever
//! `config.num_threads > 1`.
//!
//! The N points are split into `num_threads` contiguous blocks. Each worker
//! computes its block's responsibility rows (written into disjoint rows of
//! the shared matrix -- no lock needed for that) and its local contribution
//! to the training/held-out log-likelihood and the four M-step
//! accumulators. A single mutex guards the merge of those contributions;
//! `std::thread::scope` provides the barrier between the E-step and the
//! (single-threaded) M-step.

use crate::density::{log_density_diag, log_normalize_in_place, safe_log};
use crate::diag::{DiagAccumulators, DiagParams};
use ndarray::{Array1, Array2, Axis};
use std::sync::Mutex;

struct Shared {
    ll_train: f64,
    ll_held: f64,
    acc: DiagAccumulators,
}

/// Runs the E-step and M-step accumulation for one iteration across
/// `num_threads` worker threads. Returns `(ll_train, ll_held, accumulators)`
/// and fills `responsibilities` in place, identically (up to floating-point
/// summation order within a block) to the sequential path in
/// [`crate::diag`].
pub(crate) fn e_step_and_accumulate(
    params: &DiagParams,
    x: ndarray::ArrayView2<f64>,
    held_out: Option<&Array1<bool>>,
    responsibilities: &mut Array2<f64>,
    num_threads: usize,
) -> (f64, f64, DiagAccumulators) {
    let n = x.nrows();
    let d = x.ncols();
    let k = params.n_clusters();
    let log_weights = params.weights.mapv(safe_log);

    let block_size = (n + num_threads - 1) / num_threads.max(1);
    let shared = Mutex::new(Shared {
        ll_train: 0.0,
        ll_held: 0.0,
        acc: DiagAccumulators::zeros(k, d),
    });

    std::thread::scope(|scope| {
        let mut row_offset = 0usize;
        for resp_block in responsibilities.axis_chunks_iter_mut(Axis(0), block_size.max(1)) {
            let block_len = resp_block.nrows();
            let x_block = x.slice(ndarray::s![row_offset..row_offset + block_len, ..]);
            let held_out = held_out;
            let log_weights = &log_weights;
            let shared = &shared;
            let start = row_offset;

            scope.spawn(move || {
                let mut resp_block = resp_block;
                let mut local = DiagAccumulators::zeros(k, d);
                let mut local_ll_train = 0.0;
                let mut local_ll_held = 0.0;

                for (local_i, x_row) in x_block.outer_iter().enumerate() {
                    let global_i = start + local_i;
                    let mut log_joint = Array1::<f64>::zeros(k);
                    for kk in 0..k {
                        log_joint[kk] = log_weights[kk]
                            + log_density_diag(x_row, params.means.row(kk), params.variances.row(kk));
                    }
                    let ll = log_normalize_in_place(&mut log_joint);
                    resp_block.row_mut(local_i).assign(&log_joint);

                    let is_held_out = held_out.map_or(false, |h| h[global_i]);
                    if is_held_out {
                        local_ll_held += ll;
                    } else {
                        local_ll_train += ll;
                        local.accumulate(log_joint.view(), x_row);
                    }
                }

                let mut guard = shared.lock().unwrap();
                guard.ll_train += local_ll_train;
                guard.ll_held += local_ll_held;
                guard.acc.add_assign(&local);
            });

            row_offset += block_len;
        }
    });

    let shared = shared.into_inner().unwrap();
    (shared.ll_train, shared.ll_held, shared.acc)
}
