//! Spike-and-slab prior: per (latent dimension, feature view) a
//! Bernoulli activation gate decides between an exact zero (spike) and
//! a Gaussian draw (slab). Activation counts and squared-coefficient
//! sums accumulate per parallel chunk and are combined exactly once at
//! the end of each sweep; the counts are integers and can neither drop
//! nor double-count across threads.

use super::LatentPrior;
use crate::checkpoint::{read_matrix, spike_alpha_file, spike_rate_file, write_matrix_atomic};
use crate::common::*;
use crate::data::MatrixData;
use crate::model::Model;
use matrix_util::mvnormal::rgamma_scalar;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

pub struct SpikeAndSlabPrior {
    mode: usize,
    /// Slab precision per (latent, view).
    pub alpha: Mat,
    /// Activation rate per (latent, view).
    pub r: Mat,
    /// Activation counts of the previous sweep; a dimension that died
    /// out stays off.
    zkeep: Mat,

    // fixed hyper-priors
    prior_beta: f64,
    prior_alpha0: f64,
    prior_beta0: f64,

    rng: SmallRng,
}

impl SpikeAndSlabPrior {
    pub fn new(mode: usize, num_latent: usize, nview: usize, dim: usize, seed: u64) -> Self {
        SpikeAndSlabPrior {
            mode,
            alpha: Mat::from_element(num_latent, nview, 1.0),
            r: Mat::from_element(num_latent, nview, 0.5),
            zkeep: Mat::from_element(num_latent, nview, dim as f64),
            prior_beta: 1.0,
            prior_alpha0: 1.0,
            prior_beta0: 1.0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Fraction of (latent, view) cells with any active coefficient.
    pub fn active_fraction(&self) -> f64 {
        let total = (self.zkeep.nrows() * self.zkeep.ncols()) as f64;
        self.zkeep.iter().filter(|&&zz| zz > 0.0).count() as f64 / total
    }
}

impl LatentPrior for SpikeAndSlabPrior {
    fn mode(&self) -> usize {
        self.mode
    }

    fn sample_latents(&mut self, model: &mut Model, data: &mut MatrixData) -> anyhow::Result<()> {
        let mode = self.mode;
        let kk = model.num_latent();
        let nn = model.dim(mode);
        let nview = data.nview(mode);

        data.update_pnm(&model.full(), mode);

        let sweep_seed = self.rng.random::<u64>() | 1;
        let alpha = &self.alpha;
        let rr_rates = &self.r;
        let zkeep = &self.zkeep;
        let data_ref = &*data;

        let columns: Vec<usize> = (0..nn).collect();
        let chunk_size = std::cmp::max(16, nn / rayon::current_num_threads().max(1));

        struct ChunkOut {
            cols: Vec<(usize, DVec)>,
            zcount: Vec<u64>,
            w2: Vec<f64>,
        }

        let snapshot: &Model = &*model;
        let chunks: Vec<ChunkOut> = columns
            .par_chunks(chunk_size)
            .map(|chunk| {
                let sub = snapshot.full();
                let mut out = ChunkOut {
                    cols: Vec::with_capacity(chunk.len()),
                    zcount: vec![0_u64; kk * nview],
                    w2: vec![0.0; kk * nview],
                };

                for &dd in chunk {
                    let seed = sweep_seed ^ (dd as u64).wrapping_mul(COLUMN_SEED_MIX);
                    let mut rng = SmallRng::seed_from_u64(seed);

                    let vw = data_ref.view(mode, dd);
                    let (yx, xx) = data_ref.get_pnm(&sub, mode, dd, &mut rng);
                    let mut wcol = sub.col(mode, dd).into_owned();

                    for k2 in 0..kk {
                        let lambda = xx[(k2, k2)] + alpha[(k2, vw)];
                        let mu = (yx[k2] - wcol.dot(&xx.column(k2))
                            + wcol[k2] * xx[(k2, k2)])
                            / lambda;

                        let rate = rr_rates[(k2, vw)];
                        let log_r = (1.0 - rate).ln() - rate.ln();
                        let z1 = log_r
                            - 0.5 * (lambda * mu * mu - lambda.ln() + alpha[(k2, vw)].ln());
                        let zz = 1.0 / (1.0 + z1.exp());

                        if zkeep[(k2, vw)] > 0.0 && rng.random::<f64>() < zz {
                            let zrand: f64 = rng.sample(StandardNormal);
                            wcol[k2] = mu + zrand / lambda.sqrt();
                            out.zcount[k2 * nview + vw] += 1;
                        } else {
                            wcol[k2] = 0.0;
                        }
                    }

                    for k2 in 0..kk {
                        out.w2[k2 * nview + vw] += wcol[k2] * wcol[k2];
                    }
                    out.cols.push((dd, wcol));
                }

                out
            })
            .collect();

        // apply the proposals, then combine the per-chunk accumulators
        // exactly (order-independent integer sums)
        let mut zcount = vec![0_u64; kk * nview];
        let mut w2 = vec![0.0; kk * nview];
        {
            let uu = model.u_mut(mode);
            for chunk in chunks {
                for (dd, col) in chunk.cols {
                    uu.set_column(dd, &col);
                }
                for (acc, inc) in zcount.iter_mut().zip(chunk.zcount) {
                    *acc += inc;
                }
                for (acc, inc) in w2.iter_mut().zip(chunk.w2) {
                    *acc += inc;
                }
            }
        }

        // conjugate updates of the activation rate and slab precision
        let nn_f = nn as f64;
        for vw in 0..nview {
            for k2 in 0..kk {
                let zc = zcount[k2 * nview + vw] as f64;
                let w2c = w2[k2 * nview + vw];

                self.r[(k2, vw)] =
                    (zc + self.prior_beta) / (nn_f + self.prior_beta * nn_f);

                let shape = zc / 2.0 + self.prior_alpha0;
                let rate = w2c / 2.0 + self.prior_beta0;
                self.alpha[(k2, vw)] =
                    rgamma_scalar(shape, 1.0 / rate, &mut self.rng)? + 1e-7;

                self.zkeep[(k2, vw)] = zc;
            }
        }

        Ok(())
    }

    fn status(&self) -> String {
        let active = self.zkeep.iter().filter(|&&zz| zz > 0.0).count();
        format!(
            "SpikeAndSlabPrior[{}]: Z = {}/{}",
            self.mode,
            active,
            self.zkeep.nrows() * self.zkeep.ncols()
        )
    }

    fn save(&self, prefix: &str) -> anyhow::Result<()> {
        write_matrix_atomic(&self.r, &spike_rate_file(prefix, self.mode))?;
        write_matrix_atomic(&self.alpha, &spike_alpha_file(prefix, self.mode))?;
        Ok(())
    }

    fn restore(&mut self, prefix: &str) -> anyhow::Result<()> {
        self.r = read_matrix(&spike_rate_file(prefix, self.mode))?;
        self.alpha = read_matrix(&spike_alpha_file(prefix, self.mode))?;
        Ok(())
    }
}
