//! Latent factor store: one `num_latent x dim[m]` matrix per mode.

use crate::checkpoint::{model_file, read_matrix, write_matrix_atomic};
use crate::common::*;
use nalgebra::DMatrixView;
use rand::Rng;
use rand_distr::StandardNormal;
use std::cell::RefCell;

/// How factor matrices are filled at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelInit {
    Random,
    Zero,
}

impl std::str::FromStr for ModelInit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "random" => Ok(ModelInit::Random),
            "zero" => Ok(ModelInit::Zero),
            _ => Err(anyhow::anyhow!("unknown model init type: {}", s)),
        }
    }
}

thread_local! {
    /// Scratch for the >= 3-mode prediction product; resized whenever
    /// `num_latent` changes.
    static PRED_CACHE: RefCell<Vec<f64>> = const { RefCell::new(Vec::new()) };
}

/// Latent factor matrices, exclusively owned. Priors borrow one mode
/// mutably and read the other modes through [`SubModel`].
#[derive(Debug)]
pub struct Model {
    num_latent: usize,
    factors: Vec<Mat>,
}

impl Model {
    /// Allocate one factor matrix per mode and fill per `init`.
    ///
    /// * `num_latent` - number of latent dimensions (rows of every mode)
    /// * `dims` - entity count per mode
    /// * `init` - standard normal draws or zeros
    pub fn init<R: Rng>(
        num_latent: usize,
        dims: &[usize],
        init: ModelInit,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        if num_latent == 0 {
            anyhow::bail!("num_latent must be positive");
        }
        if dims.len() < 2 {
            anyhow::bail!("at least two modes are required, got {}", dims.len());
        }
        if let Some(bad) = dims.iter().position(|&d| d == 0) {
            anyhow::bail!("mode {} has zero entities", bad);
        }

        let factors = dims
            .iter()
            .map(|&nn| match init {
                ModelInit::Random => Mat::from_iterator(
                    num_latent,
                    nn,
                    (0..num_latent * nn).map(|_| rng.sample(StandardNormal)),
                ),
                ModelInit::Zero => Mat::zeros(num_latent, nn),
            })
            .collect();

        Ok(Model {
            num_latent,
            factors,
        })
    }

    pub fn num_modes(&self) -> usize {
        self.factors.len()
    }

    pub fn num_latent(&self) -> usize {
        self.num_latent
    }

    pub fn dim(&self, mode: usize) -> usize {
        self.factors[mode].ncols()
    }

    pub fn dims(&self) -> Vec<usize> {
        self.factors.iter().map(|uu| uu.ncols()).collect()
    }

    pub fn u(&self, mode: usize) -> &Mat {
        &self.factors[mode]
    }

    pub fn u_mut(&mut self, mode: usize) -> &mut Mat {
        &mut self.factors[mode]
    }

    /// Predicted value at `pos` (one entity index per mode): the sum
    /// over latent dimensions of the product of the factor entries.
    /// Side-effect free; safe to call from parallel sweeps.
    pub fn predict(&self, pos: &[usize]) -> f64 {
        debug_assert_eq!(pos.len(), self.num_modes());

        if self.num_modes() == 2 {
            return self.factors[0].column(pos[0]).dot(&self.factors[1].column(pos[1]));
        }

        let kk = self.num_latent;
        PRED_CACHE.with(|cache| {
            let mut pp = cache.borrow_mut();
            if pp.len() != kk {
                pp.resize(kk, 1.0);
            }
            pp.fill(1.0);
            for (mode, &ii) in pos.iter().enumerate() {
                let col = self.factors[mode].column(ii);
                for (row, pr) in pp.iter_mut().enumerate() {
                    *pr *= col[row];
                }
            }
            pp.iter().sum()
        })
    }

    /// The whole model as a [`SubModel`] view.
    pub fn full(&self) -> SubModel<'_> {
        SubModel {
            model: self,
            offsets: vec![0; self.num_modes()],
            dims: self.dims(),
        }
    }

    /// A view restricted to a contiguous block of one mode's columns
    /// (used when the workload is partitioned).
    pub fn block(&self, mode: usize, range: std::ops::Range<usize>) -> SubModel<'_> {
        let mut offsets = vec![0; self.num_modes()];
        let mut dims = self.dims();
        offsets[mode] = range.start;
        dims[mode] = range.len();
        SubModel {
            model: self,
            offsets,
            dims,
        }
    }

    /// Persist every mode's factor matrix keyed by mode index.
    pub fn save(&self, prefix: &str) -> anyhow::Result<()> {
        for (mode, uu) in self.factors.iter().enumerate() {
            write_matrix_atomic(uu, &model_file(prefix, mode))?;
        }
        Ok(())
    }

    /// Rebuild a model purely from persisted factor matrices; the
    /// number of modes, `num_latent`, and per-mode dimensions are all
    /// reconstructed from the files found under `prefix`.
    pub fn restore(prefix: &str) -> anyhow::Result<Self> {
        let mut factors = vec![];

        for mode in 0.. {
            let path = model_file(prefix, mode);
            if !std::path::Path::new(path.as_ref()).exists() {
                break;
            }
            factors.push(read_matrix(&path)?);
        }

        if factors.len() < 2 {
            anyhow::bail!(
                "missing factor matrix file: {}",
                model_file(prefix, factors.len())
            );
        }

        let num_latent = factors[0].nrows();
        if factors.iter().any(|uu| uu.nrows() != num_latent) {
            anyhow::bail!("factor matrices under {} disagree on num_latent", prefix);
        }

        Ok(Model {
            num_latent,
            factors,
        })
    }
}

/// Read-only window into a [`Model`]: either the whole factor matrix
/// of each mode or a contiguous sub-block.
pub struct SubModel<'a> {
    model: &'a Model,
    offsets: Vec<usize>,
    dims: Vec<usize>,
}

impl<'a> SubModel<'a> {
    pub fn num_latent(&self) -> usize {
        self.model.num_latent()
    }

    pub fn num_modes(&self) -> usize {
        self.model.num_modes()
    }

    pub fn dim(&self, mode: usize) -> usize {
        self.dims[mode]
    }

    pub fn u(&self, mode: usize) -> DMatrixView<'a, f64> {
        self.model.factors[mode].columns_range(self.offsets[mode]..self.offsets[mode] + self.dims[mode])
    }

    /// Column `ii` of the mode's block (`ii` is local to the block).
    pub fn col(&self, mode: usize, ii: usize) -> nalgebra::DVectorView<'a, f64> {
        self.model.factors[mode].column(self.offsets[mode] + ii)
    }

    /// Predict at block-local positions.
    pub fn predict(&self, pos: &[usize]) -> f64 {
        let global: Vec<usize> = pos
            .iter()
            .zip(self.offsets.iter())
            .map(|(&ii, &off)| ii + off)
            .collect();
        self.model.predict(&global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn shape_invariants() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(1);
        let model = Model::init(8, &[30, 20], ModelInit::Random, &mut rng)?;

        assert_eq!(model.num_modes(), 2);
        for mode in 0..2 {
            assert_eq!(model.u(mode).nrows(), 8);
        }
        assert_eq!(model.u(0).ncols(), 30);
        assert_eq!(model.u(1).ncols(), 20);
        Ok(())
    }

    #[test]
    fn invalid_shapes_rejected() {
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(Model::init(0, &[10, 10], ModelInit::Zero, &mut rng).is_err());
        assert!(Model::init(4, &[10], ModelInit::Zero, &mut rng).is_err());
        assert!(Model::init(4, &[10, 0], ModelInit::Zero, &mut rng).is_err());
    }

    #[test]
    fn prediction_is_a_dot_product() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(42);
        let model = Model::init(5, &[7, 9], ModelInit::Random, &mut rng)?;

        for ii in 0..7 {
            for jj in 0..9 {
                let expected = model.u(0).column(ii).dot(&model.u(1).column(jj));
                assert_eq!(model.predict(&[ii, jj]), expected);
            }
        }
        Ok(())
    }

    #[test]
    fn multi_mode_prediction_matches_elementwise_product() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(3);
        let model = Model::init(4, &[5, 6, 7], ModelInit::Random, &mut rng)?;

        let pos = [2, 3, 4];
        let mut expected = 0.0;
        for row in 0..4 {
            expected += model.u(0)[(row, 2)] * model.u(1)[(row, 3)] * model.u(2)[(row, 4)];
        }
        approx::assert_abs_diff_eq!(model.predict(&pos), expected, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn submodel_block_offsets() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(9);
        let model = Model::init(3, &[10, 12], ModelInit::Random, &mut rng)?;

        let block = model.block(1, 4..9);
        assert_eq!(block.dim(1), 5);
        assert_eq!(block.dim(0), 10);

        // block column 0 is global column 4
        let expected = model.predict(&[2, 4]);
        approx::assert_abs_diff_eq!(block.predict(&[2, 0]), expected, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn save_restore_round_trip() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(17);
        let model = Model::init(6, &[11, 13], ModelInit::Random, &mut rng)?;

        let dir = tempfile::tempdir()?;
        let prefix = dir.path().join("chk").to_str().unwrap().to_string();

        model.save(&prefix)?;
        let back = Model::restore(&prefix)?;

        assert_eq!(back.num_latent(), 6);
        assert_eq!(back.dims(), vec![11, 13]);
        for mode in 0..2 {
            assert_eq!(back.u(mode), model.u(mode));
        }
        Ok(())
    }

    #[test]
    fn restore_missing_file_is_an_error() {
        let err = Model::restore("/nonexistent/prefix").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/prefix"));
    }
}
