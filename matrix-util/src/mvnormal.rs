//! Multivariate normal and Wishart samplers parameterized by
//! precision (not covariance) matrices, as used by conjugate
//! Gibbs updates downstream.

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_distr::{ChiSquared, Gamma, StandardNormal};

/// A symmetric matrix handed to a Cholesky factorization was not
/// positive definite. Numerical failure, distinct from any
/// configuration error; callers must not fall back silently.
#[derive(Debug, Clone)]
pub struct NotPositiveDefinite(pub &'static str);

impl std::fmt::Display for NotPositiveDefinite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "matrix not positive definite: {}", self.0)
    }
}

impl std::error::Error for NotPositiveDefinite {}

fn rnorm_vec<R: Rng>(dd: usize, rng: &mut R) -> DVector<f64> {
    DVector::from_iterator(dd, (0..dd).map(|_| rng.sample(StandardNormal)))
}

fn rnorm_mat<R: Rng>(dd: usize, nn: usize, rng: &mut R) -> DMatrix<f64> {
    DMatrix::from_iterator(dd, nn, (0..dd * nn).map(|_| rng.sample(StandardNormal)))
}

/// Draw one sample from `N(mean, precision^-1)`.
///
/// With `precision = L L'`, the draw is `mean + L^-T z` for
/// `z ~ N(0, I)`.
pub fn sample_mvn_prec<R: Rng>(
    mean: &DVector<f64>,
    precision: DMatrix<f64>,
    rng: &mut R,
) -> anyhow::Result<DVector<f64>> {
    let dd = mean.len();
    let chol =
        Cholesky::new(precision).ok_or(NotPositiveDefinite("multivariate normal precision"))?;

    let zz = rnorm_vec(dd, rng);
    let xx = chol
        .l()
        .tr_solve_lower_triangular(&zz)
        .ok_or(NotPositiveDefinite("triangular solve"))?;

    Ok(mean + xx)
}

/// Draw `nn` independent zero-mean samples from `N(0, precision^-1)`,
/// one per column of the returned `d x nn` matrix.
pub fn sample_mvn_prec_cols<R: Rng>(
    precision: DMatrix<f64>,
    nn: usize,
    rng: &mut R,
) -> anyhow::Result<DMatrix<f64>> {
    let dd = precision.nrows();
    let chol =
        Cholesky::new(precision).ok_or(NotPositiveDefinite("multivariate normal precision"))?;

    let zz = rnorm_mat(dd, nn, rng);
    let xx = chol
        .l()
        .tr_solve_lower_triangular(&zz)
        .ok_or(NotPositiveDefinite("triangular solve"))?;

    Ok(xx)
}

/// Draw from `Wishart(scale, df)` by the Bartlett decomposition.
///
/// With `scale = L L'` and `A` lower triangular, `A_ii^2 ~ chi2(df - i)`,
/// `A_ij ~ N(0,1)` for `i > j`, the draw is `(L A)(L A)'`.
/// Requires `df > d - 1`.
pub fn sample_wishart<R: Rng>(
    scale: &DMatrix<f64>,
    df: f64,
    rng: &mut R,
) -> anyhow::Result<DMatrix<f64>> {
    let dd = scale.nrows();
    if df <= (dd as f64) - 1.0 {
        return Err(anyhow::anyhow!(
            "Wishart degrees of freedom {} too small for dimension {}",
            df,
            dd
        ));
    }

    let chol = Cholesky::new(scale.clone()).ok_or(NotPositiveDefinite("Wishart scale"))?;

    let mut aa = DMatrix::<f64>::zeros(dd, dd);
    for ii in 0..dd {
        let chisq = ChiSquared::new(df - ii as f64)?;
        aa[(ii, ii)] = rng.sample::<f64, _>(chisq).sqrt();
        for jj in 0..ii {
            aa[(ii, jj)] = rng.sample(StandardNormal);
        }
    }

    let la = chol.l() * aa;
    Ok(&la * la.transpose())
}

/// Draw a scalar from `Gamma(shape α, scale θ)`; `rate = 1/scale`.
pub fn rgamma_scalar<R: Rng>(shape: f64, scale: f64, rng: &mut R) -> anyhow::Result<f64> {
    let gamma = Gamma::new(shape, scale)?;
    Ok(rng.sample(gamma))
}
