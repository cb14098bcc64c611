//! Per-feature-precision link prior: one independent regularization
//! scalar per latent dimension and feature-by-feature coordinate
//! updates of the link matrix. Trades the global linear solve for
//! per-dimension adaptivity; intended for feature matrices too wide to
//! form `F'F` economically.

use super::{parallel_column_sweep, sample_column, LatentPrior};
use crate::checkpoint::{lambda_file, link_file, link_lambda_file, mu_file, read_matrix,
                        read_vector, write_matrix_atomic, write_vector_atomic};
use crate::common::*;
use crate::data::MatrixData;
use crate::model::Model;
use crate::side_info::FeatureMatrix;
use matrix_util::mvnormal::rgamma_scalar;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

pub struct LinkOnePrior {
    mode: usize,
    pub mu: DVec,
    pub lambda: DVec,
    pub beta: Mat,
    pub lambda_beta: DVec,
    uhat: Mat,

    feat: FeatureMatrix,
    f_colsq: DVec,

    // hyper-priors
    lambda_a0: f64,
    lambda_b0: f64,
    lb_a0: f64,
    lb_b0: f64,

    rng: SmallRng,
}

impl LinkOnePrior {
    pub fn new(
        mode: usize,
        num_latent: usize,
        dim: usize,
        feat: FeatureMatrix,
        lambda_beta_init: f64,
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

        let nf = feat.cols();
        let f_colsq = feat.col_sq_sums();

        Ok(LinkOnePrior {
            mode,
            mu: DVec::zeros(num_latent),
            lambda: DVec::from_element(num_latent, 10.0),
            beta: Mat::zeros(num_latent, nf),
            lambda_beta: DVec::from_element(num_latent, lambda_beta_init),
            uhat: Mat::zeros(num_latent, dim),
            feat,
            f_colsq,
            lambda_a0: 1.0,
            lambda_b0: 1.0,
            lb_a0: 1.0,
            lb_b0: 1.0,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    /// Feature-by-feature Gibbs update of `beta`; the running residual
    /// `Z = U - mu - Uhat` absorbs every accepted coordinate move.
    fn sample_beta(&mut self, uu: &Mat) -> anyhow::Result<()> {
        let kk = self.mu.len();
        let nf = self.beta.ncols();

        let mut zz = uu.clone();
        for mut col in zz.column_iter_mut() {
            col -= &self.mu;
        }
        zz -= &self.uhat;

        for ff in 0..nf {
            // zx = Z * F[:, ff]
            let mut zx = DVec::zeros(kk);
            self.feat.with_col(ff, |ii, vv| {
                zx.axpy(vv, &zz.column(ii), 1.0);
            });

            let colsq = self.f_colsq[ff];
            let mut delta = DVec::zeros(kk);
            for dd in 0..kk {
                let aa = self.lambda_beta[dd] + self.lambda[dd] * colsq;
                let bb = self.lambda[dd] * (zx[dd] + self.beta[(dd, ff)] * colsq);
                let a_inv = 1.0 / aa;
                let zrand: f64 = self.rng.sample(StandardNormal);
                let beta_new = bb * a_inv + a_inv.sqrt() * zrand;
                delta[dd] = self.beta[(dd, ff)] - beta_new;
                self.beta[(dd, ff)] = beta_new;
            }

            // Z absorbs the coordinate move: Z[:, i] += F(i, ff) * delta
            self.feat.with_col(ff, |ii, vv| {
                zz.column_mut(ii).axpy(vv, &delta, 1.0);
            });
        }

        self.uhat = self.feat.b_mul_ft(&self.beta);
        Ok(())
    }

    /// Per-dimension Normal-Gamma conjugate resample of `(mu, lambda)`
    /// given the residual `U - Uhat`.
    fn sample_mu_lambda(&mut self, uu: &Mat) -> anyhow::Result<()> {
        let kk = self.mu.len();
        let nn = uu.ncols() as f64;
        let kappa0 = 2.0;

        for dd in 0..kk {
            let mut sum = 0.0;
            for jj in 0..uu.ncols() {
                sum += uu[(dd, jj)] - self.uhat[(dd, jj)];
            }
            let mean = sum / nn;

            let mut ss = 0.0;
            for jj in 0..uu.ncols() {
                let res = uu[(dd, jj)] - self.uhat[(dd, jj)] - mean;
                ss += res * res;
            }

            let a_n = self.lambda_a0 + nn / 2.0;
            let b_n = self.lambda_b0
                + 0.5 * ss
                + 0.5 * kappa0 * nn * mean * mean / (kappa0 + nn);
            self.lambda[dd] = rgamma_scalar(a_n, 1.0 / b_n, &mut self.rng)?;

            let mu_n = nn * mean / (kappa0 + nn);
            let prec = (kappa0 + nn) * self.lambda[dd];
            let zrand: f64 = self.rng.sample(StandardNormal);
            self.mu[dd] = mu_n + zrand / prec.sqrt();
        }

        Ok(())
    }

    /// Per-dimension Gamma resample of the regularization vector.
    fn sample_lambda_beta(&mut self) -> anyhow::Result<()> {
        let kk = self.beta.nrows();
        let nf = self.beta.ncols() as f64;
        let a_n = self.lb_a0 + nf / 2.0;

        for dd in 0..kk {
            let mut ssq = 0.0;
            for ff in 0..self.beta.ncols() {
                ssq += self.beta[(dd, ff)] * self.beta[(dd, ff)];
            }
            let b_n = self.lb_b0 + ssq / 2.0;
            self.lambda_beta[dd] = rgamma_scalar(a_n, 1.0 / b_n, &mut self.rng)?;
        }

        Ok(())
    }
}

impl LatentPrior for LinkOnePrior {
    fn mode(&self) -> usize {
        self.mode
    }

    fn sample_latents(&mut self, model: &mut Model, data: &mut MatrixData) -> anyhow::Result<()> {
        let mode = self.mode;
        data.update_pnm(&model.full(), mode);

        let sweep_seed = self.rng.random::<u64>() | 1;
        let lambda = Mat::from_diagonal(&self.lambda);
        let mu = &self.mu;
        let uhat = &self.uhat;
        let data_ref = &*data;

        parallel_column_sweep(model, mode, sweep_seed, |dd, sub, rng| {
            let (rr, mm) = data_ref.get_pnm(sub, mode, dd, rng);
            let mu_eff = mu + uhat.column(dd);
            sample_column(&rr, &mm, &lambda, &mu_eff, rng)
        })?;

        let uu = model.u(mode).clone();
        self.sample_mu_lambda(&uu)?;
        self.sample_beta(&uu)?;
        self.sample_lambda_beta()?;

        Ok(())
    }

    fn link_norm(&self) -> f64 {
        self.beta.norm()
    }

    fn link_lambda(&self) -> f64 {
        self.lambda_beta.mean()
    }

    fn status(&self) -> String {
        format!(
            "LinkOnePrior[{}]: |beta| = {:.4}, mean lambda_beta = {:.4}",
            self.mode,
            self.beta.norm(),
            self.lambda_beta.mean()
        )
    }

    fn save(&self, prefix: &str) -> anyhow::Result<()> {
        write_vector_atomic(&self.mu, &mu_file(prefix, self.mode))?;
        write_vector_atomic(&self.lambda, &lambda_file(prefix, self.mode))?;
        write_matrix_atomic(&self.beta, &link_file(prefix, self.mode))?;
        write_vector_atomic(&self.lambda_beta, &link_lambda_file(prefix, self.mode))?;
        Ok(())
    }

    fn restore(&mut self, prefix: &str) -> anyhow::Result<()> {
        self.mu = read_vector(&mu_file(prefix, self.mode))?;
        self.lambda = read_vector(&lambda_file(prefix, self.mode))?;
        self.beta = read_matrix(&link_file(prefix, self.mode))?;
        self.lambda_beta = read_vector(&link_lambda_file(prefix, self.mode))?;
        self.uhat = self.feat.b_mul_ft(&self.beta);
        Ok(())
    }
}
