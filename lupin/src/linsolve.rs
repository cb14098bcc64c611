//! Regression solvers for the link-matrix resample: a direct Cholesky
//! path when `F'F` is formed, and a block conjugate-gradient path on
//! the normal equations when the feature count makes `F'F` untenable.

use crate::common::*;
use crate::side_info::FeatureMatrix;
use matrix_util::mvnormal::NotPositiveDefinite;
use nalgebra::Cholesky;

/// Right-hand sides are processed in blocks of at most this many
/// columns.
pub const CG_BLOCK_SIZE: usize = 32;

/// Iteration budget per block; running out is reported, not fatal.
pub const CG_MAX_ITER: usize = 1000;

/// Convergence report of one [`block_cg`] call.
#[derive(Debug, Clone, Copy)]
pub struct CgSummary {
    pub iterations: usize,
    pub max_residual: f64,
    pub converged: bool,
}

/// Solve `K X = rhs` for symmetric positive definite `K` by Cholesky.
/// A non-positive-definite `K` is a numerical error, signaled
/// distinctly; never silently approximated.
pub fn chol_solve(kk: Mat, rhs: &Mat) -> anyhow::Result<Mat> {
    let chol = Cholesky::new(kk).ok_or(NotPositiveDefinite("regression system"))?;
    Ok(chol.solve(rhs))
}

/// Solve `(F'F + reg I) X = rhs` without forming `F'F`.
///
/// Per-column conjugate gradient with batched matrix products across a
/// block of right-hand sides; each column stops when its relative
/// residual falls under `tol`, the block stops after [`CG_MAX_ITER`]
/// rounds. The best estimate so far is always returned together with a
/// [`CgSummary`]; callers decide whether a shortfall is worth a
/// warning.
pub fn block_cg(
    feat: &FeatureMatrix,
    reg: f64,
    rhs: &Mat,
    tol: f64,
) -> anyhow::Result<(Mat, CgSummary)> {
    let nf = feat.cols();
    if rhs.nrows() != nf {
        anyhow::bail!(
            "right-hand side has {} rows, expected {} features",
            rhs.nrows(),
            nf
        );
    }

    let mut solution = Mat::zeros(nf, rhs.ncols());
    let mut total_iters = 0;
    let mut max_residual = 0.0_f64;
    let mut converged = true;

    let mut start = 0;
    while start < rhs.ncols() {
        let len = CG_BLOCK_SIZE.min(rhs.ncols() - start);
        let block = rhs.columns(start, len).into_owned();
        let (xx, summary) = cg_block(feat, reg, &block, tol)?;
        solution.columns_mut(start, len).copy_from(&xx);

        total_iters = total_iters.max(summary.iterations);
        max_residual = max_residual.max(summary.max_residual);
        converged = converged && summary.converged;
        start += len;
    }

    Ok((
        solution,
        CgSummary {
            iterations: total_iters,
            max_residual,
            converged,
        },
    ))
}

fn cg_block(
    feat: &FeatureMatrix,
    reg: f64,
    bb: &Mat,
    tol: f64,
) -> anyhow::Result<(Mat, CgSummary)> {
    let ncol = bb.ncols();

    let norm_b: Vec<f64> = (0..ncol).map(|jj| bb.column(jj).norm().max(1e-12)).collect();

    let mut xx = Mat::zeros(bb.nrows(), ncol);
    let mut rr = bb.clone();
    let mut pp = rr.clone();
    let mut rsold: Vec<f64> = (0..ncol).map(|jj| rr.column(jj).norm_squared()).collect();
    let mut active: Vec<bool> = (0..ncol)
        .map(|jj| rsold[jj].sqrt() / norm_b[jj] >= tol)
        .collect();

    let mut iterations = 0;

    for iter in 0..CG_MAX_ITER {
        if active.iter().all(|aa| !aa) {
            break;
        }
        iterations = iter + 1;

        let mut ap = feat.normal_eq_mul(&pp);
        ap += &pp * reg;

        for jj in 0..ncol {
            if !active[jj] {
                continue;
            }
            let denom = pp.column(jj).dot(&ap.column(jj));
            if denom.abs() < f64::MIN_POSITIVE {
                active[jj] = false;
                continue;
            }
            let step = rsold[jj] / denom;

            let pj = pp.column(jj).into_owned();
            let apj = ap.column(jj).into_owned();
            xx.column_mut(jj).axpy(step, &pj, 1.0);
            rr.column_mut(jj).axpy(-step, &apj, 1.0);

            let rsnew = rr.column(jj).norm_squared();
            if rsnew.sqrt() / norm_b[jj] < tol {
                active[jj] = false;
                rsold[jj] = rsnew;
                continue;
            }

            let ratio = rsnew / rsold[jj];
            let rj = rr.column(jj).into_owned();
            let mut pj = pp.column_mut(jj);
            pj *= ratio;
            pj.axpy(1.0, &rj, 1.0);
            rsold[jj] = rsnew;
        }
    }

    let max_residual = (0..ncol)
        .map(|jj| rsold[jj].sqrt() / norm_b[jj])
        .fold(0.0, f64::max);
    let converged = active.iter().all(|aa| !aa) && max_residual.is_finite();

    Ok((
        xx,
        CgSummary {
            iterations,
            max_residual,
            converged,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_util::dmatrix_util::rnorm;
    use matrix_util::mvnormal::NotPositiveDefinite;

    #[test]
    fn chol_rejects_indefinite_systems() {
        let kk = Mat::from_row_slice(2, 2, &[1.0, 3.0, 3.0, 1.0]);
        let rhs = Mat::identity(2, 2);
        let err = chol_solve(kk, &rhs).unwrap_err();
        assert!(err.downcast_ref::<NotPositiveDefinite>().is_some());
    }

    #[test]
    fn cg_agrees_with_direct_solve() -> anyhow::Result<()> {
        let ff = rnorm(40, 12);
        let feat = FeatureMatrix::from_dense(ff)?;
        let reg = 0.5;
        let rhs = rnorm(12, 6);

        let mut kk = feat.ftf();
        for ii in 0..kk.nrows() {
            kk[(ii, ii)] += reg;
        }
        let direct = chol_solve(kk, &rhs)?;

        let (iterative, summary) = block_cg(&feat, reg, &rhs, 1e-10)?;
        assert!(summary.converged, "CG failed to converge: {:?}", summary);
        approx::assert_abs_diff_eq!(direct, iterative, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn cg_reports_shortfall_without_failing() -> anyhow::Result<()> {
        let ff = rnorm(40, 12);
        let feat = FeatureMatrix::from_dense(ff)?;
        let rhs = rnorm(12, 3);

        // impossible tolerance: must stop at the budget with a report
        let (xx, summary) = block_cg(&feat, 1e-9, &rhs, 1e-300)?;
        assert_eq!(xx.nrows(), 12);
        assert!(!summary.converged || summary.max_residual <= 1e-300);
        Ok(())
    }
}
