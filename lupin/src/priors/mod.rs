//! The latent-prior family. Every mode-prior walks through the same
//! three call points per iteration, in this order:
//! `pre_update -> sample_latents -> post_update`.
//!
//! `sample_latents` sweeps every column of its mode's factor matrix.
//! Proposals are computed in parallel against a frozen snapshot of the
//! model (the conditional for one column depends only on the *other*
//! mode's factors, so the sweep is exact), then applied column by
//! column. Per-column RNG streams are seeded deterministically.

use crate::common::*;
use crate::data::MatrixData;
use crate::model::{Model, SubModel};
use matrix_util::mvnormal::{sample_mvn_prec, sample_wishart, NotPositiveDefinite};
use nalgebra::Cholesky;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

mod link;
mod link_one;
mod normal;
mod spike_slab;

pub use link::{LinkConfig, LinkPrior};
pub use link_one::LinkOnePrior;
pub use normal::NormalPrior;
pub use spike_slab::SpikeAndSlabPrior;

/// One mode's prior: a state machine with three call points per
/// iteration plus persistence and diagnostics.
pub trait LatentPrior {
    /// Which mode's factor matrix this prior owns.
    fn mode(&self) -> usize;

    /// Hook before the column sweep; no-op by default.
    fn pre_update(&mut self, _model: &Model, _data: &mut MatrixData) -> anyhow::Result<()> {
        Ok(())
    }

    /// Resample every column of this mode's factor matrix from its
    /// conditional posterior, then this prior's hyperparameters.
    fn sample_latents(&mut self, model: &mut Model, data: &mut MatrixData) -> anyhow::Result<()>;

    /// Hook after the column sweep; no-op by default.
    fn post_update(&mut self, _model: &Model, _data: &mut MatrixData) -> anyhow::Result<()> {
        Ok(())
    }

    /// Norm of the side-information link matrix; NaN when the prior
    /// carries none.
    fn link_norm(&self) -> f64 {
        f64::NAN
    }

    /// Link regularization strength; NaN when the prior carries none.
    fn link_lambda(&self) -> f64 {
        f64::NAN
    }

    /// One-line convergence diagnostic.
    fn status(&self) -> String;

    fn save(&self, prefix: &str) -> anyhow::Result<()>;

    fn restore(&mut self, prefix: &str) -> anyhow::Result<()>;

    /// Distributed hook: perform this worker's shard of the regression
    /// workload. Returns false when the prior has no distributed work.
    fn run_worker(&mut self, _rank: usize) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Draw one column from its conditional Gaussian posterior.
///
/// `Lambda_eff = MM + Lambda`, `mu_eff = Lambda_eff^-1 (rr + Lambda mu)`;
/// the draw adds a precision-scaled standard normal on top of `mu_eff`.
pub(crate) fn sample_column(
    rr: &DVec,
    mm: &Mat,
    lambda: &Mat,
    mu: &DVec,
    rng: &mut SmallRng,
) -> anyhow::Result<DVec> {
    let lambda_eff = mm + lambda;
    let rhs = rr + lambda * mu;

    let chol =
        Cholesky::new(lambda_eff).ok_or(NotPositiveDefinite("conditional posterior precision"))?;
    let mean = chol.solve(&rhs);

    let kk = mean.len();
    let zz = DVec::from_iterator(kk, (0..kk).map(|_| rng.sample(StandardNormal)));
    let noise = chol
        .l()
        .tr_solve_lower_triangular(&zz)
        .ok_or(NotPositiveDefinite("triangular solve"))?;

    Ok(mean + noise)
}

/// Parallel sweep over the columns of `mode`: `propose` runs against a
/// frozen model snapshot with a deterministic per-column RNG, and the
/// proposals are applied once the whole sweep finishes.
pub(crate) fn parallel_column_sweep<F>(
    model: &mut Model,
    mode: usize,
    sweep_seed: u64,
    propose: F,
) -> anyhow::Result<()>
where
    F: Fn(usize, &SubModel<'_>, &mut SmallRng) -> anyhow::Result<DVec> + Sync,
{
    let nn = model.dim(mode);
    let columns: Vec<usize> = (0..nn).collect();
    let chunk_size = std::cmp::max(16, nn / rayon::current_num_threads().max(1));

    let snapshot: &Model = &*model;
    let proposals: Vec<Vec<(usize, DVec)>> = columns
        .par_chunks(chunk_size)
        .map(|chunk| {
            let sub = snapshot.full();
            let mut out = Vec::with_capacity(chunk.len());
            for &dd in chunk {
                let seed = sweep_seed ^ (dd as u64).wrapping_mul(COLUMN_SEED_MIX);
                let mut rng = SmallRng::seed_from_u64(seed);
                out.push((dd, propose(dd, &sub, &mut rng)?));
            }
            Ok(out)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let uu = model.u_mut(mode);
    for (dd, col) in proposals.into_iter().flatten() {
        uu.set_column(dd, &col);
    }

    Ok(())
}

/// Normal-Wishart conditional posterior draw given data columns `uu`.
///
/// `t_inv` is the *inverse* scale of the Wishart hyper-prior; the
/// plain Normal prior passes the identity, the link prior adds
/// `lambda_beta * beta beta'`.
pub(crate) fn cond_normal_wishart(
    uu: &Mat,
    mu0: &DVec,
    b0: f64,
    t_inv: &Mat,
    df: f64,
    rng: &mut SmallRng,
) -> anyhow::Result<(DVec, Mat)> {
    let nn = uu.ncols() as f64;

    let sum = uu.column_sum();
    let ss = uu * uu.transpose();

    let kappa_c = b0 + nn;
    let mu_c = (mu0 * b0 + sum) / kappa_c;
    let nu_c = df + nn;

    let mut t_c_inv =
        t_inv + ss + (mu0 * mu0.transpose()) * b0 - (&mu_c * mu_c.transpose()) * kappa_c;

    // keep the inverse scale symmetric before factorizing
    let t_c_inv_t = t_c_inv.transpose();
    t_c_inv += t_c_inv_t;
    t_c_inv *= 0.5;

    let scale = Cholesky::new(t_c_inv)
        .ok_or(NotPositiveDefinite("Normal-Wishart inverse scale"))?
        .inverse();

    let lambda = sample_wishart(&scale, nu_c, rng)?;
    let mu = sample_mvn_prec(&mu_c, &lambda * kappa_c, rng)?;

    Ok((mu, lambda))
}
