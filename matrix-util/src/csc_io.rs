use crate::traits::MatTriplets;
pub use nalgebra_sparse::{coo::CooMatrix, csc::CscMatrix};

impl MatTriplets for CscMatrix<f64> {
    type Mat = CscMatrix<f64>;
    type Scalar = f64;

    fn from_nonzero_triplets<I>(
        nrow: usize,
        ncol: usize,
        triplets: Vec<(I, I, Self::Scalar)>,
    ) -> anyhow::Result<Self::Mat>
    where
        I: TryInto<usize> + Copy,
        <I as TryInto<usize>>::Error: std::fmt::Debug,
    {
        if nrow == 0 || ncol == 0 {
            return Err(anyhow::anyhow!(
                "cannot build a {} x {} sparse matrix",
                nrow,
                ncol
            ));
        }

        let mut coo = CooMatrix::<f64>::new(nrow, ncol);

        for (ii, jj, val) in triplets {
            let ii: usize = ii.try_into().expect("failed to convert index");
            let jj: usize = jj.try_into().expect("failed to convert index");
            if ii >= nrow || jj >= ncol {
                return Err(anyhow::anyhow!(
                    "triplet ({}, {}) out of range for {} x {}",
                    ii,
                    jj,
                    nrow,
                    ncol
                ));
            }
            coo.push(ii, jj, val);
        }

        Ok(CscMatrix::from(&coo))
    }

    fn to_nonzero_triplets(
        &self,
    ) -> anyhow::Result<(usize, usize, Vec<(usize, usize, Self::Scalar)>)> {
        let triplets = self
            .triplet_iter()
            .map(|(ii, jj, &val)| (ii, jj, val))
            .collect::<Vec<_>>();

        Ok((self.nrows(), self.ncols(), triplets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MatTriplets;

    #[test]
    fn triplets_round_trip() -> anyhow::Result<()> {
        let triplets = vec![(0_usize, 0_usize, 1.5), (2, 1, -2.0), (1, 3, 0.25)];
        let csc = CscMatrix::from_nonzero_triplets(3, 4, triplets.clone())?;

        assert_eq!(csc.nrows(), 3);
        assert_eq!(csc.ncols(), 4);
        assert_eq!(csc.nnz(), 3);

        let (nrow, ncol, mut back) = csc.to_nonzero_triplets()?;
        assert_eq!((nrow, ncol), (3, 4));
        back.sort_by_key(|&(i, j, _)| (i, j));
        let mut fwd = triplets;
        fwd.sort_by_key(|&(i, j, _)| (i, j));
        assert_eq!(back, fwd);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range() {
        let bad = vec![(5_usize, 0_usize, 1.0)];
        assert!(CscMatrix::from_nonzero_triplets(3, 3, bad).is_err());
    }

    #[test]
    fn rejects_zero_dims() {
        let empty: Vec<(usize, usize, f64)> = vec![];
        assert!(CscMatrix::from_nonzero_triplets(0, 3, empty).is_err());
    }
}
