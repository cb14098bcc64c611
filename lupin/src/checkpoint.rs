//! Checkpoint artifact layout: one file set per retained sample,
//! gzip-compressed tsv matrices keyed by mode index. Every write goes
//! through a scratch file and a rename so an interrupted checkpoint
//! never corrupts a previously written one.

use crate::common::*;
use matrix_util::common_io::part_file_path;
use matrix_util::traits::IoOps;

pub fn sample_prefix(prefix: &str, isample: usize) -> String {
    format!("{}-sample{}", prefix, isample)
}

pub fn model_file(prefix: &str, mode: usize) -> Box<str> {
    format!("{}-U{}.tsv.gz", prefix, mode).into_boxed_str()
}

pub fn mu_file(prefix: &str, mode: usize) -> Box<str> {
    format!("{}-mu{}.tsv.gz", prefix, mode).into_boxed_str()
}

pub fn lambda_file(prefix: &str, mode: usize) -> Box<str> {
    format!("{}-Lambda{}.tsv.gz", prefix, mode).into_boxed_str()
}

pub fn link_file(prefix: &str, mode: usize) -> Box<str> {
    format!("{}-link{}.tsv.gz", prefix, mode).into_boxed_str()
}

pub fn link_lambda_file(prefix: &str, mode: usize) -> Box<str> {
    format!("{}-link-lambda{}.tsv.gz", prefix, mode).into_boxed_str()
}

pub fn spike_rate_file(prefix: &str, mode: usize) -> Box<str> {
    format!("{}-spike-rate{}.tsv.gz", prefix, mode).into_boxed_str()
}

pub fn spike_alpha_file(prefix: &str, mode: usize) -> Box<str> {
    format!("{}-spike-alpha{}.tsv.gz", prefix, mode).into_boxed_str()
}

/// Write `mat` to `path` through a scratch file, then rename.
pub fn write_matrix_atomic(mat: &Mat, path: &str) -> anyhow::Result<()> {
    let part = part_file_path(path);
    mat.to_tsv(&part)?;
    std::fs::rename(part.as_ref(), path)?;
    Ok(())
}

/// Read a matrix back; the error names the missing path.
pub fn read_matrix(path: &str) -> anyhow::Result<Mat> {
    if !std::path::Path::new(path).exists() {
        anyhow::bail!("checkpoint file not found: {}", path);
    }
    Mat::from_tsv(path, None)
}

/// Write a vector as a one-column matrix.
pub fn write_vector_atomic(vec: &DVec, path: &str) -> anyhow::Result<()> {
    let mat = Mat::from_column_slice(vec.len(), 1, vec.as_slice());
    write_matrix_atomic(&mat, path)
}

pub fn read_vector(path: &str) -> anyhow::Result<DVec> {
    let mat = read_matrix(path)?;
    if mat.ncols() != 1 {
        anyhow::bail!("expected a one-column vector in {}", path);
    }
    Ok(DVec::from_column_slice(mat.column(0).as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_round_trip_is_exact() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("m.tsv.gz");
        let path = path.to_str().unwrap();

        let mat = Mat::from_row_slice(2, 3, &[1.25, -0.5, 3.0, 0.1, 1e-9, -7.75]);
        write_matrix_atomic(&mat, path)?;

        let back = read_matrix(path)?;
        assert_eq!(mat, back);
        Ok(())
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_matrix("/no/such/checkpoint.tsv.gz").unwrap_err();
        assert!(err.to_string().contains("/no/such/checkpoint.tsv.gz"));
    }

    #[test]
    fn vector_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("v.tsv.gz");
        let path = path.to_str().unwrap();

        let vec = DVec::from_vec(vec![0.5, -1.5, 2.25]);
        write_vector_atomic(&vec, path)?;
        assert_eq!(read_vector(path)?, vec);
        Ok(())
    }
}
