//! Side-information ("link") prior: the latent factors of one mode are
//! regressed on a feature matrix `F` through a link matrix `beta`,
//! resampled every iteration by ridge regression with a sampled
//! right-hand side. Extends the Normal-Wishart prior, which then acts
//! on the residual `U - Uhat`.

use super::{cond_normal_wishart, parallel_column_sweep, sample_column, LatentPrior, NormalPrior};
use crate::checkpoint::{link_file, link_lambda_file, read_matrix, write_matrix_atomic};
use crate::common::*;
use crate::data::MatrixData;
use crate::distributed::{partition_features, sharded_ft_y};
use crate::linsolve::{block_cg, chol_solve, CgSummary};
use crate::model::Model;
use crate::side_info::FeatureMatrix;
use matrix_util::mvnormal::{rgamma_scalar, sample_mvn_prec_cols};
use rand::rngs::SmallRng;

#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Direct Cholesky solve on `F'F + lambda_beta I` vs. block
    /// conjugate gradient. Dense features must use the direct solver.
    pub use_direct: bool,
    /// Residual tolerance of the iterative solver.
    pub tol: f64,
    pub lambda_beta_init: f64,
    /// Partition the regression across this many workers.
    pub num_workers: Option<usize>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            use_direct: true,
            tol: 1e-6,
            lambda_beta_init: 5.0,
            num_workers: None,
        }
    }
}

pub(crate) struct WorkerState {
    pub tmp: Mat,
    pub prior_noise: Mat,
    pub sqrt_lb: f64,
}

pub struct LinkPrior {
    pub(crate) base: NormalPrior,
    feat: FeatureMatrix,
    ftf: Option<Mat>,
    pub beta: Mat,
    pub(crate) uhat: Mat,
    pub lambda_beta: f64,

    // Hyper-prior for lambda_beta (mean 1.0, weak)
    lb_mu0: f64,
    lb_nu0: f64,

    tol: f64,
    use_direct: bool,
    partition: Option<Vec<std::ops::Range<usize>>>,
    worker_state: Option<WorkerState>,
    last_cg: Option<CgSummary>,
}

impl LinkPrior {
    /// * `dim` - entity count of this mode; must equal `feat.rows()`
    pub fn new(
        mode: usize,
        num_latent: usize,
        dim: usize,
        feat: FeatureMatrix,
        config: LinkConfig,
        seed: u64,
    ) -> anyhow::Result<Self> {
        if feat.rows() != dim {
            anyhow::bail!(
                "side information has {} rows but mode {} has {} entities",
                feat.rows(),
                mode,
                dim
            );
        }
        if feat.is_dense() && !config.use_direct {
            anyhow::bail!("dense side information requires the direct solver");
        }

        let ftf = config.use_direct.then(|| feat.ftf());
        let nf = feat.cols();

        let partition = match config.num_workers {
            Some(workers) => Some(partition_features(nf, workers)?),
            None => None,
        };

        Ok(LinkPrior {
            base: NormalPrior::new(mode, num_latent, seed),
            ftf,
            beta: Mat::zeros(num_latent, nf),
            uhat: Mat::zeros(num_latent, dim),
            lambda_beta: config.lambda_beta_init,
            lb_mu0: 1.0,
            lb_nu0: 1e-3,
            tol: config.tol,
            use_direct: config.use_direct,
            partition,
            worker_state: None,
            last_cg: None,
            feat,
        })
    }

    pub fn num_features(&self) -> usize {
        self.feat.cols()
    }

    pub(crate) fn last_cg(&self) -> Option<CgSummary> {
        self.last_cg
    }

    /// Right-hand side of the ridge regression:
    /// `Ft_y = (U - mu + N(0, Lambda^-1)) * F + sqrt(lambda_beta) * N(0, Lambda^-1)`.
    pub(crate) fn compute_ft_y(&mut self, uu: &Mat) -> anyhow::Result<Mat> {
        let nn = uu.ncols();
        let nf = self.feat.cols();

        let mut tmp = uu + sample_mvn_prec_cols(self.base.lambda.clone(), nn, &mut self.base.rng)?;
        for mut col in tmp.column_iter_mut() {
            col -= &self.base.mu;
        }

        let prior_noise =
            sample_mvn_prec_cols(self.base.lambda.clone(), nf, &mut self.base.rng)?;
        let sqrt_lb = self.lambda_beta.sqrt();

        let ft_y = match &self.partition {
            Some(ranges) => sharded_ft_y(&self.feat, &tmp, &prior_noise, sqrt_lb, ranges)?,
            None => self.feat.a_mul_f(&tmp) + &prior_noise * sqrt_lb,
        };

        self.worker_state = Some(WorkerState {
            tmp,
            prior_noise,
            sqrt_lb,
        });

        Ok(ft_y)
    }

    /// Resample `beta` by the configured solver.
    pub(crate) fn sample_beta(&mut self, uu: &Mat) -> anyhow::Result<()> {
        let ft_y = self.compute_ft_y(uu)?;

        if self.use_direct {
            let mut kk = self
                .ftf
                .clone()
                .expect("F'F is always formed for the direct solver");
            for ii in 0..kk.nrows() {
                kk[(ii, ii)] += self.lambda_beta;
            }
            self.beta = chol_solve(kk, &ft_y.transpose())?.transpose();
        } else {
            let (sol, summary) = block_cg(&self.feat, self.lambda_beta, &ft_y.transpose(), self.tol)?;
            if !summary.converged {
                log::warn!(
                    "link regression (mode {}) stopped after {} iterations, residual {:.3e}",
                    self.base.mode(),
                    summary.iterations,
                    summary.max_residual
                );
            }
            self.last_cg = Some(summary);
            self.beta = sol.transpose();
        }

        Ok(())
    }

    /// One worker's shard of the pending regression right-hand side.
    pub(crate) fn worker_shard(&self, rank: usize) -> anyhow::Result<Mat> {
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("link prior is not partitioned"))?;
        if rank >= partition.len() {
            anyhow::bail!("worker rank {} beyond partition size {}", rank, partition.len());
        }
        let range = partition[rank].clone();
        if range.is_empty() {
            anyhow::bail!("worker {} received an empty feature range", rank);
        }

        let state = self
            .worker_state
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("worker {} invoked with no pending regression", rank))?;

        let mut shard = self.feat.a_mul_f_range(&state.tmp, range.clone());
        shard += state.prior_noise.columns_range(range) * state.sqrt_lb;
        Ok(shard)
    }
}

/// Gamma posterior parameters for the scalar regularization strength.
pub(crate) fn posterior_lambda_beta(
    beta: &Mat,
    lambda_u: &Mat,
    nu: f64,
    mu: f64,
) -> (f64, f64) {
    let bbt = beta * beta.transpose();
    let nux = nu + (beta.nrows() * beta.ncols()) as f64;
    let mux = mu * nux / (nu + mu * (&bbt * lambda_u).trace());
    let shape = nux / 2.0;
    let scale = 2.0 * mux / nux;
    (shape, scale)
}

pub(crate) fn sample_lambda_beta(
    beta: &Mat,
    lambda_u: &Mat,
    nu: f64,
    mu: f64,
    rng: &mut SmallRng,
) -> anyhow::Result<f64> {
    let (shape, scale) = posterior_lambda_beta(beta, lambda_u, nu, mu);
    rgamma_scalar(shape, scale, rng)
}

impl LatentPrior for LinkPrior {
    fn mode(&self) -> usize {
        self.base.mode()
    }

    fn sample_latents(&mut self, model: &mut Model, data: &mut MatrixData) -> anyhow::Result<()> {
        let mode = self.mode();
        data.update_pnm(&model.full(), mode);

        let sweep_seed = self.base.sweep_seed();
        let lambda = &self.base.lambda;
        let mu = &self.base.mu;
        let uhat = &self.uhat;
        let data_ref = &*data;

        parallel_column_sweep(model, mode, sweep_seed, |dd, sub, rng| {
            let (rr, mm) = data_ref.get_pnm(sub, mode, dd, rng);
            let mu_eff = mu + uhat.column(dd);
            sample_column(&rr, &mm, lambda, &mu_eff, rng)
        })?;

        // Normal-Wishart on the residual, with the link matrix folded
        // into the Wishart inverse scale
        let resid = model.u(mode) - &self.uhat;
        let bbt = &self.beta * self.beta.transpose();
        let t_inv = &self.base.wi + bbt * self.lambda_beta;
        let df = self.base.df + self.feat.cols() as f64;
        let (mu, lambda) =
            cond_normal_wishart(&resid, &self.base.mu0, self.base.b0, &t_inv, df, &mut self.base.rng)?;
        self.base.mu = mu;
        self.base.lambda = lambda;

        self.sample_beta(model.u(mode))?;
        self.uhat = self.feat.b_mul_ft(&self.beta);

        self.lambda_beta = sample_lambda_beta(
            &self.beta,
            &self.base.lambda,
            self.lb_nu0,
            self.lb_mu0,
            &mut self.base.rng,
        )?;

        Ok(())
    }

    fn link_norm(&self) -> f64 {
        self.beta.norm()
    }

    fn link_lambda(&self) -> f64 {
        self.lambda_beta
    }

    fn status(&self) -> String {
        format!(
            "LinkPrior[{}]: |beta| = {:.4}, lambda_beta = {:.4}",
            self.mode(),
            self.beta.norm(),
            self.lambda_beta
        )
    }

    fn save(&self, prefix: &str) -> anyhow::Result<()> {
        self.base.save(prefix)?;
        write_matrix_atomic(&self.beta, &link_file(prefix, self.mode()))?;
        write_matrix_atomic(
            &Mat::from_element(1, 1, self.lambda_beta),
            &link_lambda_file(prefix, self.mode()),
        )?;
        Ok(())
    }

    fn restore(&mut self, prefix: &str) -> anyhow::Result<()> {
        self.base.restore(prefix)?;
        self.beta = read_matrix(&link_file(prefix, self.mode()))?;
        self.lambda_beta = read_matrix(&link_lambda_file(prefix, self.mode()))?[(0, 0)];
        self.uhat = self.feat.b_mul_ft(&self.beta);
        Ok(())
    }

    fn run_worker(&mut self, rank: usize) -> anyhow::Result<bool> {
        if self.partition.is_none() {
            return Ok(false);
        }
        self.worker_shard(rank)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_util::dmatrix_util::rnorm;
    use matrix_util::mvnormal::NotPositiveDefinite;

    /// Known `beta0`, targets `U = beta0 F' + noise`: the direct solver
    /// must recover `beta0` as the prior noise and regularization
    /// vanish.
    #[test]
    fn direct_solver_recovers_the_generating_link_matrix() -> anyhow::Result<()> {
        let (kk, nn, nf) = (3, 400, 5);
        let ff = rnorm(nn, nf);
        let beta0 = rnorm(kk, nf);
        let uu = &beta0 * ff.transpose() + rnorm(kk, nn) * 0.01;

        let feat = FeatureMatrix::from_dense(ff)?;
        let mut prior = LinkPrior::new(0, kk, nn, feat, LinkConfig::default(), 7)?;

        // tight residual precision, negligible regularization
        prior.base.lambda = Mat::identity(kk, kk) * 1e8;
        prior.base.mu = DVec::zeros(kk);
        prior.lambda_beta = 1e-8;

        prior.sample_beta(&uu)?;

        approx::assert_abs_diff_eq!(prior.beta, beta0, epsilon = 0.05);
        Ok(())
    }

    /// Direct Cholesky and block CG must agree on the same system.
    #[test]
    fn direct_and_iterative_solvers_agree() -> anyhow::Result<()> {
        let (kk, nn, nf) = (4, 60, 8);
        let ff = rnorm(nn, nf);
        let uu = rnorm(kk, nn);

        let mut triplets = vec![];
        for ii in 0..nn {
            for jj in 0..nf {
                triplets.push((ii, jj, ff[(ii, jj)]));
            }
        }

        let seed = 1234;
        let direct_cfg = LinkConfig {
            use_direct: true,
            ..LinkConfig::default()
        };
        let cg_cfg = LinkConfig {
            use_direct: false,
            tol: 1e-10,
            ..LinkConfig::default()
        };

        let mut direct = LinkPrior::new(
            0,
            kk,
            nn,
            FeatureMatrix::from_dense(ff.clone())?,
            direct_cfg,
            seed,
        )?;
        let mut iterative = LinkPrior::new(
            0,
            kk,
            nn,
            FeatureMatrix::from_triplets(nn, nf, triplets)?,
            cg_cfg,
            seed,
        )?;

        // identical RNG seeds: both priors draw the same right-hand side
        direct.sample_beta(&uu)?;
        iterative.sample_beta(&uu)?;

        assert!(iterative.last_cg().unwrap().converged);
        approx::assert_abs_diff_eq!(direct.beta, iterative.beta, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn dense_features_with_iterative_solver_is_a_config_error() {
        let ff = rnorm(10, 3);
        let feat = FeatureMatrix::from_dense(ff).unwrap();
        let config = LinkConfig {
            use_direct: false,
            ..LinkConfig::default()
        };
        assert!(LinkPrior::new(0, 2, 10, feat, config, 1).is_err());
    }

    #[test]
    fn mismatched_entity_count_is_a_config_error() {
        let feat = FeatureMatrix::from_dense(rnorm(10, 3)).unwrap();
        assert!(LinkPrior::new(0, 2, 12, feat, LinkConfig::default(), 1).is_err());
    }

    /// Partitioning the regression across workers must not change
    /// `beta`: same seeds, same draws, identical solve.
    #[test]
    fn distributed_regression_matches_single_worker() -> anyhow::Result<()> {
        let (kk, nn, nf) = (3, 50, 10);
        let ff = rnorm(nn, nf);
        let uu = rnorm(kk, nn);

        let seed = 99;
        let betas: Vec<Mat> = [None, Some(1), Some(2), Some(5)]
            .into_iter()
            .map(|workers| -> anyhow::Result<Mat> {
                let config = LinkConfig {
                    num_workers: workers,
                    ..LinkConfig::default()
                };
                let mut prior = LinkPrior::new(
                    0,
                    kk,
                    nn,
                    FeatureMatrix::from_dense(ff.clone())?,
                    config,
                    seed,
                )?;
                prior.sample_beta(&uu)?;
                Ok(prior.beta.clone())
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        for beta in &betas[1..] {
            approx::assert_abs_diff_eq!(betas[0], *beta, epsilon = 1e-10);
        }
        Ok(())
    }

    /// Workers re-run their shard on demand; an out-of-range rank or a
    /// missing pending system is an error.
    #[test]
    fn worker_shards_validate_their_rank() -> anyhow::Result<()> {
        let (kk, nn, nf) = (2, 20, 6);
        let config = LinkConfig {
            num_workers: Some(3),
            ..LinkConfig::default()
        };
        let mut prior = LinkPrior::new(
            0,
            kk,
            nn,
            FeatureMatrix::from_dense(rnorm(nn, nf))?,
            config,
            17,
        )?;

        // no pending regression yet
        assert!(prior.run_worker(0).is_err());

        let uu = rnorm(kk, nn);
        prior.sample_beta(&uu)?;
        assert!(prior.run_worker(0)?);
        assert!(prior.run_worker(2)?);
        assert!(prior.run_worker(3).is_err());
        Ok(())
    }

    /// Pathological `lambda_beta -> 0` on a rank-deficient system must
    /// surface as a numerical error, not a silent wrong factorization.
    #[test]
    fn rank_deficient_system_reports_a_numerical_error() -> anyhow::Result<()> {
        // more features than entities: F'F singular
        let (kk, nn, nf) = (2, 3, 6);
        let ff = rnorm(nn, nf);
        let uu = rnorm(kk, nn);

        let feat = FeatureMatrix::from_dense(ff)?;
        let mut prior = LinkPrior::new(0, kk, nn, feat, LinkConfig::default(), 3)?;
        prior.lambda_beta = 0.0;

        let err = prior.sample_beta(&uu).unwrap_err();
        assert!(err.downcast_ref::<NotPositiveDefinite>().is_some());
        Ok(())
    }
}
