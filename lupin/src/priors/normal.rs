//! Normal-Wishart prior without side information: the classic
//! probabilistic matrix factorization baseline.

use super::{cond_normal_wishart, parallel_column_sweep, sample_column, LatentPrior};
use crate::checkpoint::{lambda_file, mu_file, read_matrix, read_vector, write_matrix_atomic,
                        write_vector_atomic};
use crate::common::*;
use crate::data::MatrixData;
use crate::model::Model;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub struct NormalPrior {
    mode: usize,
    pub mu: DVec,
    pub lambda: Mat,

    // fixed hyper-priors
    pub(crate) mu0: DVec,
    pub(crate) b0: f64,
    pub(crate) wi: Mat,
    pub(crate) df: f64,

    pub(crate) rng: SmallRng,
}

impl NormalPrior {
    pub fn new(mode: usize, num_latent: usize, seed: u64) -> Self {
        NormalPrior {
            mode,
            mu: DVec::zeros(num_latent),
            lambda: Mat::identity(num_latent, num_latent) * 10.0,
            mu0: DVec::zeros(num_latent),
            b0: 2.0,
            wi: Mat::identity(num_latent, num_latent),
            df: num_latent as f64,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn sweep_seed(&mut self) -> u64 {
        self.rng.random::<u64>() | 1
    }
}

impl LatentPrior for NormalPrior {
    fn mode(&self) -> usize {
        self.mode
    }

    fn sample_latents(&mut self, model: &mut Model, data: &mut MatrixData) -> anyhow::Result<()> {
        let mode = self.mode;
        data.update_pnm(&model.full(), mode);

        let sweep_seed = self.sweep_seed();
        let lambda = &self.lambda;
        let mu = &self.mu;
        let data_ref = &*data;

        parallel_column_sweep(model, mode, sweep_seed, |dd, sub, rng| {
            let (rr, mm) = data_ref.get_pnm(sub, mode, dd, rng);
            sample_column(&rr, &mm, lambda, mu, rng)
        })?;

        // conjugate resample of (mu, Lambda) given the fresh columns
        let (mu, lambda) =
            cond_normal_wishart(model.u(mode), &self.mu0, self.b0, &self.wi, self.df, &mut self.rng)?;
        self.mu = mu;
        self.lambda = lambda;

        Ok(())
    }

    fn status(&self) -> String {
        format!("NormalPrior[{}]: |mu| = {:.4}", self.mode, self.mu.norm())
    }

    fn save(&self, prefix: &str) -> anyhow::Result<()> {
        write_vector_atomic(&self.mu, &mu_file(prefix, self.mode))?;
        write_matrix_atomic(&self.lambda, &lambda_file(prefix, self.mode))?;
        Ok(())
    }

    fn restore(&mut self, prefix: &str) -> anyhow::Result<()> {
        self.mu = read_vector(&mu_file(prefix, self.mode))?;
        self.lambda = read_matrix(&lambda_file(prefix, self.mode))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelInit;
    use crate::noise::NoiseConfig;

    /// With zero observations in some columns, those columns must keep
    /// following the hyperprior: their long-run average approaches `mu`.
    #[test]
    fn empty_columns_revert_to_the_hyperprior_mean() -> anyhow::Result<()> {
        let kk = 3;
        let mut rng = SmallRng::seed_from_u64(123);
        let mut model = Model::init(kk, &[4, 6], ModelInit::Zero, &mut rng)?;

        // only column 0 of mode 0 is observed
        let triplets = vec![(0_usize, 0_usize, 1.0), (0, 1, 0.5), (0, 2, -0.5)];
        let mut data = MatrixData::from_triplets(
            4,
            6,
            triplets,
            true,
            NoiseConfig::Fixed { precision: 1.0 },
        )?;

        let mut prior = NormalPrior::new(0, kk, 99);
        // freeze the hyperparameters so the average is predictable
        let mu_target = DVec::from_vec(vec![0.8, -0.3, 0.2]);

        let reps = 3000;
        let mut acc = DVec::zeros(kk);
        for _ in 0..reps {
            prior.mu = mu_target.clone();
            prior.lambda = Mat::identity(kk, kk) * 5.0;

            let mode = prior.mode;
            data.update_pnm(&model.full(), mode);
            let sweep_seed = prior.sweep_seed();
            let lambda = prior.lambda.clone();
            let mu = prior.mu.clone();
            let data_ref = &data;
            parallel_column_sweep(&mut model, mode, sweep_seed, |dd, sub, rng| {
                let (rr, mm) = data_ref.get_pnm(sub, mode, dd, rng);
                sample_column(&rr, &mm, &lambda, &mu, rng)
            })?;

            // column 3 of mode 0 has no observations at all
            acc += model.u(0).column(3);
        }
        acc /= reps as f64;

        for ii in 0..kk {
            assert!(
                (acc[ii] - mu_target[ii]).abs() < 0.05,
                "dim {}: {} vs {}",
                ii,
                acc[ii],
                mu_target[ii]
            );
        }
        Ok(())
    }

    #[test]
    fn save_restore_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let prefix = dir.path().join("pp").to_str().unwrap().to_string();

        let mut prior = NormalPrior::new(1, 4, 7);
        prior.mu = DVec::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        prior.save(&prefix)?;

        let mut back = NormalPrior::new(1, 4, 8);
        back.restore(&prefix)?;
        assert_eq!(back.mu, prior.mu);
        assert_eq!(back.lambda, prior.lambda);
        Ok(())
    }
}
