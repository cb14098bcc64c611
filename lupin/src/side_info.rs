//! Side-information feature matrices (`entities x features`), in the
//! three encodings the priors consume through one capability surface:
//! dense real, sparse real, and sparse binary (implicit unit values).

use crate::common::*;
use matrix_util::traits::MatTriplets;
use nalgebra_sparse::CsrMatrix;

pub enum FeatureMatrix {
    Dense(Mat),
    Sparse(SpMat),
    /// Stored values are all one; every product skips the multiply.
    SparseBinary(SpMat),
}

impl FeatureMatrix {
    pub fn from_dense(ff: Mat) -> anyhow::Result<Self> {
        if ff.nrows() == 0 || ff.ncols() == 0 {
            anyhow::bail!("empty dense feature matrix");
        }
        Ok(FeatureMatrix::Dense(ff))
    }

    pub fn from_triplets(
        nrow: usize,
        ncol: usize,
        triplets: Vec<(usize, usize, f64)>,
    ) -> anyhow::Result<Self> {
        Ok(FeatureMatrix::Sparse(SpMat::from_nonzero_triplets(
            nrow, ncol, triplets,
        )?))
    }

    /// Binary index pairs `(row, col)` with implicit value 1.
    pub fn from_binary_pairs(
        nrow: usize,
        ncol: usize,
        pairs: Vec<(usize, usize)>,
    ) -> anyhow::Result<Self> {
        let triplets = pairs.into_iter().map(|(ii, jj)| (ii, jj, 1.0)).collect();
        Ok(FeatureMatrix::SparseBinary(SpMat::from_nonzero_triplets(
            nrow, ncol, triplets,
        )?))
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, FeatureMatrix::Dense(_))
    }

    /// Number of entities (must match the mode's entity count).
    pub fn rows(&self) -> usize {
        match self {
            FeatureMatrix::Dense(ff) => ff.nrows(),
            FeatureMatrix::Sparse(ff) | FeatureMatrix::SparseBinary(ff) => ff.nrows(),
        }
    }

    /// Number of features.
    pub fn cols(&self) -> usize {
        match self {
            FeatureMatrix::Dense(ff) => ff.ncols(),
            FeatureMatrix::Sparse(ff) | FeatureMatrix::SparseBinary(ff) => ff.ncols(),
        }
    }

    /// `A * F` for a dense `A` (`k x n` -> `k x f`).
    pub fn a_mul_f(&self, aa: &Mat) -> Mat {
        self.a_mul_f_range(aa, 0..self.cols())
    }

    /// `A * F[:, range]`, the shard of `A * F` owned by one worker.
    pub fn a_mul_f_range(&self, aa: &Mat, range: std::ops::Range<usize>) -> Mat {
        debug_assert_eq!(aa.ncols(), self.rows());
        match self {
            FeatureMatrix::Dense(ff) => aa * ff.columns_range(range),
            FeatureMatrix::Sparse(ff) => {
                let mut out = Mat::zeros(aa.nrows(), range.len());
                for (local, jj) in range.enumerate() {
                    let col = ff.col(jj);
                    let mut out_j = out.column_mut(local);
                    for (&ii, &vv) in col.row_indices().iter().zip(col.values()) {
                        out_j.axpy(vv, &aa.column(ii), 1.0);
                    }
                }
                out
            }
            FeatureMatrix::SparseBinary(ff) => {
                let mut out = Mat::zeros(aa.nrows(), range.len());
                for (local, jj) in range.enumerate() {
                    let col = ff.col(jj);
                    let mut out_j = out.column_mut(local);
                    for &ii in col.row_indices() {
                        out_j.axpy(1.0, &aa.column(ii), 1.0);
                    }
                }
                out
            }
        }
    }

    /// `B * F'` for a dense `B` (`k x f` -> `k x n`); this is how the
    /// factor offset `Uhat = beta * F'` is rebuilt.
    pub fn b_mul_ft(&self, bb: &Mat) -> Mat {
        debug_assert_eq!(bb.ncols(), self.cols());
        match self {
            FeatureMatrix::Dense(ff) => bb * ff.transpose(),
            FeatureMatrix::Sparse(ff) => {
                let mut out = Mat::zeros(bb.nrows(), ff.nrows());
                for jj in 0..ff.ncols() {
                    let col = ff.col(jj);
                    for (&ii, &vv) in col.row_indices().iter().zip(col.values()) {
                        out.column_mut(ii).axpy(vv, &bb.column(jj), 1.0);
                    }
                }
                out
            }
            FeatureMatrix::SparseBinary(ff) => {
                let mut out = Mat::zeros(bb.nrows(), ff.nrows());
                for jj in 0..ff.ncols() {
                    let col = ff.col(jj);
                    for &ii in col.row_indices() {
                        out.column_mut(ii).axpy(1.0, &bb.column(jj), 1.0);
                    }
                }
                out
            }
        }
    }

    /// `F' * F`, densely stored (`f x f`). Only tractable when the
    /// feature count is modest; the iterative solver avoids it.
    pub fn ftf(&self) -> Mat {
        match self {
            FeatureMatrix::Dense(ff) => ff.tr_mul(ff),
            FeatureMatrix::Sparse(ff) => sparse_ftf(ff, false),
            FeatureMatrix::SparseBinary(ff) => sparse_ftf(ff, true),
        }
    }

    /// Per-feature sum of squares (the diagonal of `F' * F`).
    pub fn col_sq_sums(&self) -> DVec {
        match self {
            FeatureMatrix::Dense(ff) => {
                DVec::from_iterator(ff.ncols(), ff.column_iter().map(|col| col.norm_squared()))
            }
            FeatureMatrix::Sparse(ff) => DVec::from_iterator(
                ff.ncols(),
                (0..ff.ncols()).map(|jj| {
                    ff.col(jj).values().iter().map(|vv| vv * vv).sum::<f64>()
                }),
            ),
            FeatureMatrix::SparseBinary(ff) => DVec::from_iterator(
                ff.ncols(),
                (0..ff.ncols()).map(|jj| ff.col(jj).nnz() as f64),
            ),
        }
    }

    /// `F' * (F * X)` without forming `F' * F`; the matrix-vector
    /// workhorse of the conjugate-gradient solver (`f x r` -> `f x r`).
    pub fn normal_eq_mul(&self, xx: &Mat) -> Mat {
        debug_assert_eq!(xx.nrows(), self.cols());
        match self {
            FeatureMatrix::Dense(ff) => ff.tr_mul(&(ff * xx)),
            FeatureMatrix::Sparse(ff) => {
                let rr = xx.ncols();
                let mut fx = Mat::zeros(ff.nrows(), rr);
                for jj in 0..ff.ncols() {
                    let col = ff.col(jj);
                    for (&ii, &vv) in col.row_indices().iter().zip(col.values()) {
                        for cc in 0..rr {
                            fx[(ii, cc)] += vv * xx[(jj, cc)];
                        }
                    }
                }
                let mut out = Mat::zeros(ff.ncols(), rr);
                for jj in 0..ff.ncols() {
                    let col = ff.col(jj);
                    for (&ii, &vv) in col.row_indices().iter().zip(col.values()) {
                        for cc in 0..rr {
                            out[(jj, cc)] += vv * fx[(ii, cc)];
                        }
                    }
                }
                out
            }
            FeatureMatrix::SparseBinary(ff) => {
                let rr = xx.ncols();
                let mut fx = Mat::zeros(ff.nrows(), rr);
                for jj in 0..ff.ncols() {
                    let col = ff.col(jj);
                    for &ii in col.row_indices() {
                        for cc in 0..rr {
                            fx[(ii, cc)] += xx[(jj, cc)];
                        }
                    }
                }
                let mut out = Mat::zeros(ff.ncols(), rr);
                for jj in 0..ff.ncols() {
                    let col = ff.col(jj);
                    for &ii in col.row_indices() {
                        for cc in 0..rr {
                            out[(jj, cc)] += fx[(ii, cc)];
                        }
                    }
                }
                out
            }
        }
    }

    /// Visit the stored entries of feature column `jj` as
    /// `(entity, value)` pairs; dense columns visit every entity.
    pub fn with_col(&self, jj: usize, mut visit: impl FnMut(usize, f64)) {
        match self {
            FeatureMatrix::Dense(ff) => {
                for ii in 0..ff.nrows() {
                    visit(ii, ff[(ii, jj)]);
                }
            }
            FeatureMatrix::Sparse(ff) => {
                let col = ff.col(jj);
                for (&ii, &vv) in col.row_indices().iter().zip(col.values()) {
                    visit(ii, vv);
                }
            }
            FeatureMatrix::SparseBinary(ff) => {
                let col = ff.col(jj);
                for &ii in col.row_indices() {
                    visit(ii, 1.0);
                }
            }
        }
    }
}

/// Row-wise accumulation of `F' * F` through a CSR pass.
fn sparse_ftf(ff: &SpMat, binary: bool) -> Mat {
    let nf = ff.ncols();
    let mut out = Mat::zeros(nf, nf);
    let csr = CsrMatrix::from(ff);

    for row in csr.row_iter() {
        let cols = row.col_indices();
        let vals = row.values();
        for (aa, &j1) in cols.iter().enumerate() {
            let v1 = if binary { 1.0 } else { vals[aa] };
            for (bb, &j2) in cols.iter().enumerate() {
                let v2 = if binary { 1.0 } else { vals[bb] };
                out[(j1, j2)] += v1 * v2;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_and_sparse() -> (FeatureMatrix, FeatureMatrix) {
        let ff = Mat::from_row_slice(
            4,
            3,
            &[
                1.0, 0.0, 2.0, //
                0.0, 0.0, 0.0, //
                -1.0, 3.0, 0.0, //
                0.5, 0.0, 1.0,
            ],
        );
        let mut triplets = vec![];
        for ii in 0..4 {
            for jj in 0..3 {
                if ff[(ii, jj)] != 0.0 {
                    triplets.push((ii, jj, ff[(ii, jj)]));
                }
            }
        }
        (
            FeatureMatrix::from_dense(ff).unwrap(),
            FeatureMatrix::from_triplets(4, 3, triplets).unwrap(),
        )
    }

    #[test]
    fn sparse_matches_dense_products() {
        let (dense, sparse) = dense_and_sparse();
        let aa = Mat::from_row_slice(2, 4, &[1.0, 2.0, 3.0, 4.0, -1.0, 0.5, 0.0, 2.0]);
        let bb = Mat::from_row_slice(2, 3, &[1.0, -1.0, 0.5, 2.0, 0.0, 1.0]);
        let xx = Mat::from_row_slice(3, 2, &[1.0, 0.0, 0.5, -1.0, 2.0, 1.0]);

        approx::assert_abs_diff_eq!(dense.a_mul_f(&aa), sparse.a_mul_f(&aa), epsilon = 1e-12);
        approx::assert_abs_diff_eq!(dense.b_mul_ft(&bb), sparse.b_mul_ft(&bb), epsilon = 1e-12);
        approx::assert_abs_diff_eq!(dense.ftf(), sparse.ftf(), epsilon = 1e-12);
        approx::assert_abs_diff_eq!(
            dense.col_sq_sums(),
            sparse.col_sq_sums(),
            epsilon = 1e-12
        );
        approx::assert_abs_diff_eq!(
            dense.normal_eq_mul(&xx),
            sparse.normal_eq_mul(&xx),
            epsilon = 1e-12
        );
    }

    #[test]
    fn binary_features_behave_like_unit_values() {
        let pairs = vec![(0, 0), (2, 0), (1, 1), (3, 2)];
        let binary = FeatureMatrix::from_binary_pairs(4, 3, pairs.clone()).unwrap();
        let triplets = pairs.into_iter().map(|(ii, jj)| (ii, jj, 1.0)).collect();
        let sparse = FeatureMatrix::from_triplets(4, 3, triplets).unwrap();

        let aa = Mat::from_row_slice(2, 4, &[1.0, 2.0, 3.0, 4.0, 0.0, -1.0, 1.0, 0.5]);
        approx::assert_abs_diff_eq!(binary.a_mul_f(&aa), sparse.a_mul_f(&aa), epsilon = 1e-12);
        approx::assert_abs_diff_eq!(binary.ftf(), sparse.ftf(), epsilon = 1e-12);
    }

    #[test]
    fn sharded_product_concatenates_to_the_full_one() {
        let (dense, _) = dense_and_sparse();
        let aa = Mat::from_row_slice(2, 4, &[1.0, 2.0, 3.0, 4.0, -1.0, 0.5, 0.0, 2.0]);

        let full = dense.a_mul_f(&aa);
        let left = dense.a_mul_f_range(&aa, 0..2);
        let right = dense.a_mul_f_range(&aa, 2..3);

        approx::assert_abs_diff_eq!(full.columns(0, 2).into_owned(), left, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(full.columns(2, 1).into_owned(), right, epsilon = 1e-12);
    }
}
