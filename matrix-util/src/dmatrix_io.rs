use crate::common_io::{read_lines_of_types, write_lines, Delimiter};
use crate::traits::IoOps;
pub use nalgebra::{DMatrix, DVector};
use num_traits::{FromPrimitive, ToPrimitive};

use std::fmt::{Debug, Display};
use std::str::FromStr;

impl<T> IoOps for DMatrix<T>
where
    T: PartialOrd
        + FromPrimitive
        + ToPrimitive
        + nalgebra::Scalar
        + Send
        + FromStr
        + Display
        + Copy,
    <T as FromStr>::Err: Debug,
{
    type Scalar = T;
    type Mat = Self;

    fn read_file_delim(
        tsv_file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat> {
        let hdr_line = match skip {
            Some(skip) => skip as i64,
            None => -1, // no skipping
        };

        let data = read_lines_of_types::<T>(tsv_file, delim, hdr_line)?.lines;

        if data.is_empty() {
            return Err(anyhow::anyhow!("No data in file"));
        }

        let ncols = data[0].len();
        let nrows = data.len();
        let data = data.into_iter().flatten().collect::<Vec<_>>();

        Ok(DMatrix::<T>::from_row_iterator(nrows, ncols, data))
    }

    fn write_file_delim(&self, tsv_file: &str, delim: &str) -> anyhow::Result<()> {
        // row order must be preserved
        let lines = self
            .row_iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", *x))
                    .collect::<Vec<String>>()
                    .join(delim)
                    .into_boxed_str()
            })
            .collect::<Vec<_>>();

        write_lines(&lines, tsv_file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::common_io::create_temp_dir_file;
    use crate::traits::{IoOps, SampleOps};

    #[test]
    fn dmatrix_io_round_trip() -> anyhow::Result<()> {
        let xx = nalgebra::DMatrix::<f64>::runif(50, 50);

        let tsv_file = create_temp_dir_file(".txt.gz")?;
        let tsv_file = tsv_file.to_str().unwrap();
        xx.to_tsv(tsv_file)?;

        let yy = nalgebra::DMatrix::<f64>::from_tsv(tsv_file, None)?;

        approx::assert_abs_diff_eq!(xx, yy, epsilon = 1e-8);

        Ok(())
    }
}
