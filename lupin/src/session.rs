//! The training loop: `Init -> burn-in -> sampling -> Done`, with a
//! fixed phase sequence per iteration across the two mode priors, one
//! noise update, metric refresh, and an optional checkpoint write.
//! Cancellation is cooperative and observed only at iteration
//! boundaries; a triggered token lets the current iteration finish
//! cleanly.

use crate::checkpoint::sample_prefix;
use crate::data::MatrixData;
use crate::model::Model;
use crate::noise::NoiseModel;
use crate::priors::LatentPrior;
use crate::result::TestResult;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative early-stop signal, checked once per iteration boundary.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub burnin: usize,
    pub nsamples: usize,
    /// Checkpoint artifact prefix; no checkpointing when absent.
    pub save_prefix: Option<Box<str>>,
    /// Write every n-th retained sample; 0 disables checkpointing.
    pub save_freq: usize,
    /// Decision threshold enabling AUC on the held-out entries.
    pub threshold: Option<f64>,
    pub seed: u64,
    pub show_progress: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            burnin: 200,
            nsamples: 800,
            save_prefix: None,
            save_freq: 0,
            threshold: None,
            seed: 1234,
            show_progress: true,
        }
    }
}

pub struct Session {
    pub model: Model,
    pub data: MatrixData,
    priors: Vec<Box<dyn LatentPrior>>,
    pub result: TestResult,
    config: SessionConfig,
    cancel: CancelToken,
    rng: SmallRng,
}

impl Session {
    /// Exactly two mode priors are required for the matrix case, one
    /// per mode, with dimensions agreeing with the observed data.
    pub fn new(
        model: Model,
        data: MatrixData,
        priors: Vec<Box<dyn LatentPrior>>,
        test: Vec<(usize, usize, f64)>,
        config: SessionConfig,
    ) -> anyhow::Result<Self> {
        if priors.len() != 2 {
            anyhow::bail!("exactly two mode priors are required, got {}", priors.len());
        }
        if model.num_modes() != 2 {
            anyhow::bail!(
                "the sampling path is two-mode, the model has {} modes",
                model.num_modes()
            );
        }

        let mut seen = [false; 2];
        for prior in priors.iter() {
            let mode = prior.mode();
            if mode >= 2 || seen[mode] {
                anyhow::bail!("priors must cover modes 0 and 1 exactly once");
            }
            seen[mode] = true;
        }

        for mode in 0..2 {
            if model.dim(mode) != data.dim(mode) {
                anyhow::bail!(
                    "mode {}: model has {} entities, data has {}",
                    mode,
                    model.dim(mode),
                    data.dim(mode)
                );
            }
        }

        for &(row, col, _) in &test {
            if row >= data.dim(0) || col >= data.dim(1) {
                anyhow::bail!("test entry ({}, {}) out of range", row, col);
            }
        }

        let result = TestResult::new(test, config.threshold);
        let rng = SmallRng::seed_from_u64(config.seed);
        Ok(Session {
            model,
            data,
            priors,
            result,
            config,
            cancel: CancelToken::new(),
            rng,
        })
    }

    /// A clone of the early-stop token; trigger it from anywhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Number of iterations actually completed.
    pub fn run(&mut self) -> anyhow::Result<usize> {
        let total = self.config.burnin + self.config.nsamples;
        let entities: usize = (0..self.model.num_modes()).map(|mm| self.model.dim(mm)).sum();

        let pb = ProgressBar::new(total as u64);
        if !self.config.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let start = Instant::now();
        let mut completed = 0;

        for iter in 0..total {
            if self.cancel.is_cancelled() {
                info!("early stop after {} iterations", completed);
                break;
            }
            if iter == self.config.burnin {
                info!("burn-in complete, averaging samples");
            }
            let iter_start = Instant::now();

            for prior in self.priors.iter_mut() {
                prior.pre_update(&self.model, &mut self.data)?;
            }
            for prior in self.priors.iter_mut() {
                prior.sample_latents(&mut self.model, &mut self.data)?;
            }
            for prior in self.priors.iter_mut() {
                prior.post_update(&self.model, &mut self.data)?;
            }

            if matches!(self.data.noise(), NoiseModel::Adaptive { .. }) {
                let sumsq = self.data.sumsq(&self.model.full());
                let nobs = self.data.nobs();
                self.data.noise_mut().update(sumsq, nobs, &mut self.rng)?;
            }

            let burnin_done = iter >= self.config.burnin;
            self.result
                .update(&self.model, self.data.mean_value(), burnin_done);

            if burnin_done {
                let isample = iter - self.config.burnin + 1;
                if self.config.save_freq > 0 && isample % self.config.save_freq == 0 {
                    self.save_checkpoint(isample)?;
                }
            }

            completed += 1;
            let elapsed = start.elapsed().as_secs_f64();
            let throughput = (completed * entities) as f64 / elapsed.max(1e-9);
            info!(
                "iter {:4}/{}: RMSE {:.4e} (1samp {:.4e}) AUC {:.4} U [{:.2e}, {:.2e}] link [{:.2e}, {:.2e}] {} [{:.1}s, {:.0} entities/s]",
                iter + 1,
                total,
                self.result.rmse_avg,
                self.result.rmse,
                self.result.auc,
                self.model.u(0).norm(),
                self.model.u(1).norm(),
                self.priors[0].link_norm(),
                self.priors[1].link_norm(),
                self.data.noise().status(),
                iter_start.elapsed().as_secs_f64(),
                throughput,
            );
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(completed)
    }

    /// What a non-zero rank does instead of [`Session::run`]: its
    /// shard of the regression workload, once per signal. Asking a
    /// worker to run when no prior carries distributed work is a
    /// defensive error, never a silent no-op.
    pub fn run_worker(&mut self, rank: usize) -> anyhow::Result<()> {
        let mut work_done = false;
        for prior in self.priors.iter_mut() {
            work_done |= prior.run_worker(rank)?;
        }
        if !work_done {
            anyhow::bail!("worker {} was invoked but found no partitioned work", rank);
        }
        Ok(())
    }

    fn save_checkpoint(&self, isample: usize) -> anyhow::Result<()> {
        let prefix = match &self.config.save_prefix {
            Some(pp) => pp,
            None => return Ok(()),
        };
        let sp = sample_prefix(prefix, isample);
        self.model.save(&sp)?;
        for prior in self.priors.iter() {
            prior.save(&sp)?;
        }
        Ok(())
    }

    pub fn status(&self) -> String {
        self.priors
            .iter()
            .map(|prior| prior.status())
            .collect::<Vec<_>>()
            .join("; ")
    }
}
