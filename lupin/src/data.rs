//! Observed-data views over the training matrix `Y`. The shape is
//! fixed at construction; the priors only consume pseudo-observation
//! sufficient statistics `(rr, MM)` per column under the current
//! noise precision.
//!
//! Four densities with different accumulation strategies:
//!
//! * dense - every row of a column is observed
//! * sparse - stored nonzeros plus implicit observed zeros; the
//!   precision-weighted `V V'` term is cached once per mode pass
//! * scarce - unobserved entries are missing, only stored entries
//!   contribute
//! * scarce binary - stored index pairs with implicit value 1; admits
//!   the probit noise model

use crate::common::*;
use crate::model::SubModel;
use crate::noise::{NoiseConfig, NoiseModel};
use matrix_util::traits::MatTriplets;
use rand::rngs::SmallRng;
use rayon::prelude::*;

struct PnmCache {
    vvt: Mat,
    vsum: DVec,
}

enum DataKind {
    Dense { yy: Mat, yt: Mat },
    Sparse { yc: SpMat, yct: SpMat, cache: Vec<Option<PnmCache>> },
    Scarce { yc: SpMat, yct: SpMat },
    ScarceBinary { yc: SpMat, yct: SpMat },
}

pub struct MatrixData {
    kind: DataKind,
    nrow: usize,
    ncol: usize,
    nnz: usize,
    mean_value: f64,
    noise: NoiseModel,
    views: Vec<Option<Vec<usize>>>,
}

impl MatrixData {
    /// Fully observed dense matrix.
    pub fn from_dense(yy: Mat, noise: NoiseConfig) -> anyhow::Result<Self> {
        if yy.nrows() == 0 || yy.ncols() == 0 {
            anyhow::bail!("empty observed matrix");
        }
        if matches!(noise, NoiseConfig::Probit { .. }) {
            anyhow::bail!("probit noise requires scarce binary observations");
        }

        let (nrow, ncol) = (yy.nrows(), yy.ncols());
        let size = (nrow * ncol) as f64;
        let mean_value = yy.sum() / size;

        let se: f64 = yy.iter().map(|vv| (vv - mean_value) * (vv - mean_value)).sum();
        let var_total = floor_var(se / size);

        let yt = yy.transpose();
        Ok(MatrixData {
            kind: DataKind::Dense { yy, yt },
            nrow,
            ncol,
            nnz: nrow * ncol,
            mean_value,
            noise: NoiseModel::init(noise, var_total),
            views: vec![None, None],
        })
    }

    /// Sparse triplets. With `scarce` the unobserved entries are
    /// missing; otherwise they are observed zeros.
    pub fn from_triplets(
        nrow: usize,
        ncol: usize,
        triplets: Vec<(usize, usize, f64)>,
        scarce: bool,
        noise: NoiseConfig,
    ) -> anyhow::Result<Self> {
        if matches!(noise, NoiseConfig::Probit { .. }) && !scarce {
            anyhow::bail!("probit noise requires scarce observations");
        }

        let yc = SpMat::from_nonzero_triplets(nrow, ncol, triplets)?;
        let yct = yc.transpose();
        let nnz = yc.nnz();
        if nnz == 0 {
            anyhow::bail!("observed matrix has no entries");
        }

        let sum: f64 = yc.values().iter().sum();
        let sum_sq: f64 = yc.values().iter().map(|vv| vv * vv).sum();

        let (kind, mean_value, var_total) = if scarce {
            let nn = nnz as f64;
            let mean = if matches!(noise, NoiseConfig::Probit { .. }) {
                0.0
            } else {
                sum / nn
            };
            let var = floor_var(sum_sq / nn - (sum / nn) * (sum / nn));
            (DataKind::Scarce { yc, yct }, mean, var)
        } else {
            let size = (nrow * ncol) as f64;
            let mean = sum / size;
            let var = floor_var(sum_sq / size - mean * mean);
            (
                DataKind::Sparse {
                    yc,
                    yct,
                    cache: vec![None, None],
                },
                mean,
                var,
            )
        };

        Ok(MatrixData {
            kind,
            nrow,
            ncol,
            nnz,
            mean_value,
            noise: NoiseModel::init(noise, var_total),
            views: vec![None, None],
        })
    }

    /// Binary index pairs with implicit value 1; always scarce.
    pub fn from_binary_pairs(
        nrow: usize,
        ncol: usize,
        pairs: Vec<(usize, usize)>,
        noise: NoiseConfig,
    ) -> anyhow::Result<Self> {
        let triplets = pairs.into_iter().map(|(ii, jj)| (ii, jj, 1.0)).collect();
        let yc = SpMat::from_nonzero_triplets(nrow, ncol, triplets)?;
        let yct = yc.transpose();
        let nnz = yc.nnz();
        if nnz == 0 {
            anyhow::bail!("observed matrix has no entries");
        }

        Ok(MatrixData {
            kind: DataKind::ScarceBinary { yc, yct },
            nrow,
            ncol,
            nnz,
            mean_value: 0.0,
            noise: NoiseModel::init(noise, 1.0),
            views: vec![None, None],
        })
    }

    pub fn size(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// Number of observed entries (differs from `nnz` only for the
    /// implicit-zero sparse view).
    pub fn nobs(&self) -> usize {
        match self.kind {
            DataKind::Dense { .. } | DataKind::Sparse { .. } => self.size(),
            DataKind::Scarce { .. } | DataKind::ScarceBinary { .. } => self.nnz,
        }
    }

    pub fn dim(&self, mode: usize) -> usize {
        match mode {
            0 => self.nrow,
            1 => self.ncol,
            _ => panic!("matrix data has two modes, asked for mode {}", mode),
        }
    }

    pub fn mean_value(&self) -> f64 {
        self.mean_value
    }

    pub fn noise(&self) -> &NoiseModel {
        &self.noise
    }

    pub fn noise_mut(&mut self) -> &mut NoiseModel {
        &mut self.noise
    }

    /// Assign each column of `mode` to a side-information view
    /// (`0..nview`, contiguous); single view when never called.
    pub fn set_views(&mut self, mode: usize, views: Vec<usize>) -> anyhow::Result<()> {
        if views.len() != self.dim(mode) {
            anyhow::bail!(
                "view map length {} != mode {} dimension {}",
                views.len(),
                mode,
                self.dim(mode)
            );
        }
        let nview = views.iter().max().map(|&vv| vv + 1).unwrap_or(1);
        for vv in 0..nview {
            if !views.contains(&vv) {
                anyhow::bail!("view {} has no columns", vv);
            }
        }
        self.views[mode] = Some(views);
        Ok(())
    }

    pub fn nview(&self, mode: usize) -> usize {
        self.views[mode]
            .as_ref()
            .and_then(|vv| vv.iter().max().map(|&mx| mx + 1))
            .unwrap_or(1)
    }

    pub fn view(&self, mode: usize, dd: usize) -> usize {
        self.views[mode].as_ref().map(|vv| vv[dd]).unwrap_or(0)
    }

    /// Refresh the per-pass cache the implicit-zero sparse view needs
    /// (`V V'` and the other-mode column sum). Call once before the
    /// per-column sweep over `mode`.
    pub fn update_pnm(&mut self, sub: &SubModel<'_>, mode: usize) {
        if let DataKind::Sparse { cache, .. } = &mut self.kind {
            let vv = sub.u(1 - mode).into_owned();
            let vvt = &vv * vv.transpose();
            let vsum = vv.column_sum();
            cache[mode] = Some(PnmCache { vvt, vsum });
        }
    }

    /// Pseudo-observation statistics for column `dd` of `mode`: the
    /// precision-weighted sum `rr` and outer-product sum `MM` over the
    /// observed entries, against the other mode's current factors.
    pub fn get_pnm(
        &self,
        sub: &SubModel<'_>,
        mode: usize,
        dd: usize,
        rng: &mut SmallRng,
    ) -> (DVec, Mat) {
        let kk = sub.num_latent();
        let vv = sub.u(1 - mode);
        let alpha = self.noise.alpha();
        let mean = self.mean_value;

        let mut rr = DVec::zeros(kk);
        let mut mm = Mat::zeros(kk, kk);

        match &self.kind {
            DataKind::Dense { yy, yt } => {
                let ym = if mode == 0 { yt } else { yy };
                let col = ym.column(dd);
                for (ii, &raw) in col.iter().enumerate() {
                    let vcol = vv.column(ii);
                    rr.axpy((raw - mean) * alpha, &vcol, 1.0);
                    mm.ger(alpha, &vcol, &vcol, 1.0);
                }
            }
            DataKind::Sparse { yc, yct, cache } => {
                let cached = cache[mode]
                    .as_ref()
                    .expect("update_pnm must run before the column sweep");
                mm.copy_from(&cached.vvt);
                mm *= alpha;

                let ym = if mode == 0 { yct } else { yc };
                let col = ym.col(dd);
                for (&ii, &raw) in col.row_indices().iter().zip(col.values()) {
                    rr.axpy(raw * alpha, &vv.column(ii), 1.0);
                }
                // implicit zeros contribute -mean at every cell
                rr.axpy(-mean * alpha, &cached.vsum, 1.0);
            }
            DataKind::Scarce { yc, yct } => {
                let ym = if mode == 0 { yct } else { yc };
                let col = ym.col(dd);
                if self.noise.is_probit() {
                    for (&ii, &raw) in col.row_indices().iter().zip(col.values()) {
                        let pos = if mode == 0 { [dd, ii] } else { [ii, dd] };
                        let pred = sub.predict(&pos);
                        let zz = self.noise.probit_pseudo(pred, raw, rng);
                        let vcol = vv.column(ii);
                        rr.axpy(zz, &vcol, 1.0);
                        mm.ger(1.0, &vcol, &vcol, 1.0);
                    }
                } else {
                    for (&ii, &raw) in col.row_indices().iter().zip(col.values()) {
                        let vcol = vv.column(ii);
                        rr.axpy((raw - mean) * alpha, &vcol, 1.0);
                        mm.ger(alpha, &vcol, &vcol, 1.0);
                    }
                }
            }
            DataKind::ScarceBinary { yc, yct } => {
                let ym = if mode == 0 { yct } else { yc };
                let col = ym.col(dd);
                if self.noise.is_probit() {
                    for &ii in col.row_indices() {
                        let pos = if mode == 0 { [dd, ii] } else { [ii, dd] };
                        let pred = sub.predict(&pos);
                        let zz = self.noise.probit_pseudo(pred, 1.0, rng);
                        let vcol = vv.column(ii);
                        rr.axpy(zz, &vcol, 1.0);
                        mm.ger(1.0, &vcol, &vcol, 1.0);
                    }
                } else {
                    for &ii in col.row_indices() {
                        let vcol = vv.column(ii);
                        rr.axpy(alpha, &vcol, 1.0);
                        mm.ger(alpha, &vcol, &vcol, 1.0);
                    }
                }
            }
        }

        (rr, mm)
    }

    /// Residual sum of squares over the observed entries under the
    /// current model; feeds the adaptive noise update.
    pub fn sumsq(&self, sub: &SubModel<'_>) -> f64 {
        let mean = self.mean_value;
        match &self.kind {
            DataKind::Dense { yy, .. } => (0..self.ncol)
                .into_par_iter()
                .map(|jj| {
                    let col = yy.column(jj);
                    col.iter()
                        .enumerate()
                        .map(|(ii, &raw)| {
                            let res = (raw - mean) - sub.predict(&[ii, jj]);
                            res * res
                        })
                        .sum::<f64>()
                })
                .sum(),
            DataKind::Sparse { yc, .. } => {
                // every cell observed: closed form over implicit zeros,
                // corrected at the stored entries
                let uu = sub.u(0).into_owned();
                let ww = sub.u(1).into_owned();
                let gu = &uu * uu.transpose();
                let gw = &ww * ww.transpose();
                let su = uu.column_sum();
                let sw = ww.column_sum();

                let sum_pred_sq = (&gu * &gw).trace();
                let sum_pred = su.dot(&sw);
                let size = self.size() as f64;

                // sum over all cells of (mean + pred)^2
                let mut total = size * mean * mean + 2.0 * mean * sum_pred + sum_pred_sq;

                // replace the zero-cell term at stored entries
                for (ii, jj, &raw) in yc.triplet_iter() {
                    let pred = sub.predict(&[ii, jj]);
                    let zero_term = (mean + pred) * (mean + pred);
                    let res = (raw - mean) - pred;
                    total += res * res - zero_term;
                }
                total
            }
            DataKind::Scarce { yc, .. } => yc
                .triplet_iter()
                .map(|(ii, jj, &raw)| {
                    let res = (raw - mean) - sub.predict(&[ii, jj]);
                    res * res
                })
                .sum(),
            DataKind::ScarceBinary { yc, .. } => yc
                .triplet_iter()
                .map(|(ii, jj, _)| {
                    let res = 1.0 - sub.predict(&[ii, jj]);
                    res * res
                })
                .sum(),
        }
    }

    pub fn train_rmse(&self, sub: &SubModel<'_>) -> f64 {
        (self.sumsq(sub) / self.nobs() as f64).sqrt()
    }
}

fn floor_var(var: f64) -> f64 {
    if var.is_nan() || var <= 0.0 {
        1.0
    } else {
        var
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelInit};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn fixed() -> NoiseConfig {
        NoiseConfig::Fixed { precision: 2.0 }
    }

    #[test]
    fn construction_rejects_bad_shapes() {
        assert!(MatrixData::from_dense(Mat::zeros(0, 0), fixed()).is_err());
        assert!(MatrixData::from_triplets(0, 4, vec![], true, fixed()).is_err());
        assert!(MatrixData::from_triplets(3, 3, vec![(5, 0, 1.0)], true, fixed()).is_err());
    }

    #[test]
    fn probit_requires_scarce_binary_data() {
        let probit = NoiseConfig::Probit { threshold: 0.5 };
        assert!(MatrixData::from_dense(Mat::zeros(3, 3), probit).is_err());
        assert!(MatrixData::from_triplets(3, 3, vec![(0, 0, 1.0)], false, probit).is_err());
        assert!(MatrixData::from_binary_pairs(3, 3, vec![(0, 0)], probit).is_ok());
    }

    #[test]
    fn dense_and_scarce_pnm_agree_on_fully_observed_data() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(7);
        let model = Model::init(4, &[6, 5], ModelInit::Random, &mut rng)?;

        let yy = matrix_util::dmatrix_util::rnorm(6, 5);
        let mut triplets = vec![];
        for ii in 0..6 {
            for jj in 0..5 {
                triplets.push((ii, jj, yy[(ii, jj)]));
            }
        }

        let dense = MatrixData::from_dense(yy.clone(), fixed())?;
        let scarce = MatrixData::from_triplets(6, 5, triplets, true, fixed())?;

        let sub = model.full();
        for mode in 0..2 {
            for dd in 0..dense.dim(mode) {
                let mut r1 = SmallRng::seed_from_u64(1);
                let mut r2 = SmallRng::seed_from_u64(1);
                let (rr_d, mm_d) = dense.get_pnm(&sub, mode, dd, &mut r1);
                let (rr_s, mm_s) = scarce.get_pnm(&sub, mode, dd, &mut r2);
                approx::assert_abs_diff_eq!(rr_d, rr_s, epsilon = 1e-9);
                approx::assert_abs_diff_eq!(mm_d, mm_s, epsilon = 1e-9);
            }
        }
        Ok(())
    }

    #[test]
    fn implicit_zero_sparse_matches_dense_with_zeros() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(19);
        let model = Model::init(3, &[5, 4], ModelInit::Random, &mut rng)?;

        let mut yy = Mat::zeros(5, 4);
        let triplets = vec![(0_usize, 1_usize, 2.0), (2, 0, -1.0), (4, 3, 0.5)];
        for &(ii, jj, vv) in &triplets {
            yy[(ii, jj)] = vv;
        }

        let dense = MatrixData::from_dense(yy, fixed())?;
        let mut sparse = MatrixData::from_triplets(5, 4, triplets, false, fixed())?;

        let sub = model.full();
        for mode in 0..2 {
            sparse.update_pnm(&sub, mode);
            for dd in 0..dense.dim(mode) {
                let mut r1 = SmallRng::seed_from_u64(1);
                let mut r2 = SmallRng::seed_from_u64(1);
                let (rr_d, mm_d) = dense.get_pnm(&sub, mode, dd, &mut r1);
                let (rr_s, mm_s) = sparse.get_pnm(&sub, mode, dd, &mut r2);
                approx::assert_abs_diff_eq!(rr_d, rr_s, epsilon = 1e-9);
                approx::assert_abs_diff_eq!(mm_d, mm_s, epsilon = 1e-9);
            }
        }
        Ok(())
    }

    #[test]
    fn sparse_sumsq_matches_dense() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(29);
        let model = Model::init(3, &[5, 4], ModelInit::Random, &mut rng)?;

        let mut yy = Mat::zeros(5, 4);
        let triplets = vec![(0_usize, 1_usize, 2.0), (2, 0, -1.0), (4, 3, 0.5)];
        for &(ii, jj, vv) in &triplets {
            yy[(ii, jj)] = vv;
        }

        let dense = MatrixData::from_dense(yy, fixed())?;
        let sparse = MatrixData::from_triplets(5, 4, triplets, false, fixed())?;

        let sub = model.full();
        approx::assert_abs_diff_eq!(dense.sumsq(&sub), sparse.sumsq(&sub), epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn view_maps_validate() -> anyhow::Result<()> {
        let mut data =
            MatrixData::from_triplets(3, 4, vec![(0, 0, 1.0), (2, 3, 1.0)], true, fixed())?;
        assert_eq!(data.nview(1), 1);
        assert_eq!(data.view(1, 2), 0);

        data.set_views(1, vec![0, 0, 1, 1])?;
        assert_eq!(data.nview(1), 2);
        assert_eq!(data.view(1, 2), 1);

        assert!(data.set_views(1, vec![0, 0, 2, 2]).is_err());
        assert!(data.set_views(1, vec![0, 1]).is_err());
        Ok(())
    }
}
