pub use nalgebra::{DMatrix, DVector};
pub use rand::Rng;
pub use rand_distr::{Gamma, StandardNormal, Uniform};
pub use rayon::prelude::*;

use crate::traits::SampleOps;

/// Sample d,n matrix from U(0,1)
pub fn runif(dd: usize, nn: usize) -> DMatrix<f64> {
    let runif = Uniform::new(0_f64, 1_f64).expect("invalid uniform range");

    let rvec = (0..(dd * nn))
        .into_par_iter()
        .map_init(rand::rng, |rng, _| rng.sample(runif))
        .collect();

    DMatrix::<f64>::from_vec(dd, nn, rvec)
}

/// Sample d,n matrix from N(0,1)
pub fn rnorm(dd: usize, nn: usize) -> DMatrix<f64> {
    let rvec = (0..(dd * nn))
        .into_par_iter()
        .map_init(rand::rng, |rng, _| rng.sample(StandardNormal))
        .collect();

    DMatrix::<f64>::from_vec(dd, nn, rvec)
}

/// Sample d,n matrix from Gamma(shape α, scale θ)
pub fn rgamma(dd: usize, nn: usize, param: (f64, f64)) -> DMatrix<f64> {
    let (shape, scale) = param;
    let rgamma = Gamma::new(shape, scale).expect("invalid gamma parameters");

    let rvec = (0..(dd * nn))
        .into_par_iter()
        .map_init(rand::rng, |rng, _| rng.sample(rgamma))
        .collect();

    DMatrix::<f64>::from_vec(dd, nn, rvec)
}

impl SampleOps for DMatrix<f64> {
    type Mat = DMatrix<f64>;
    type Scalar = f64;

    fn runif(dd: usize, nn: usize) -> Self::Mat {
        runif(dd, nn)
    }

    fn rnorm(dd: usize, nn: usize) -> Self::Mat {
        rnorm(dd, nn)
    }

    fn rgamma(dd: usize, nn: usize, param: (f64, f64)) -> Self::Mat {
        rgamma(dd, nn, param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rnorm_moments() {
        let xx = rnorm(100, 100);
        let n = (xx.nrows() * xx.ncols()) as f64;
        let mean = xx.sum() / n;
        let var = xx.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
        assert!(mean.abs() < 0.05, "sample mean too far from 0: {}", mean);
        assert!((var - 1.0).abs() < 0.1, "sample var too far from 1: {}", var);
    }

    #[test]
    fn runif_range() {
        let xx = runif(50, 50);
        assert!(xx.iter().all(|&x| (0.0..1.0).contains(&x)));
    }
}
