use matrix_util::common_io::{create_temp_dir_file, part_file_path, write_lines_atomic};
use matrix_util::traits::{IoOps, MatTriplets, SampleOps};
use nalgebra_sparse::CscMatrix;

#[test]
fn dmatrix_io_test() -> anyhow::Result<()> {
    let xx = nalgebra::DMatrix::<f64>::runif(50, 50);

    let tsv_file = create_temp_dir_file(".txt.gz")?;
    let tsv_file = tsv_file.to_str().unwrap();
    xx.to_tsv(tsv_file)?;

    let yy = nalgebra::DMatrix::<f64>::read_file_delim(tsv_file, "\t", None)?;

    approx::assert_abs_diff_eq!(xx, yy);

    Ok(())
}

#[test]
fn csc_triplet_test() -> anyhow::Result<()> {
    let triplets = vec![(0_u32, 1_u32, 0.5), (3, 0, 2.0), (2, 2, -1.0)];
    let csc = CscMatrix::from_nonzero_triplets(4, 3, triplets)?;
    let (nrow, ncol, out) = csc.to_nonzero_triplets()?;

    assert_eq!(nrow, 4);
    assert_eq!(ncol, 3);
    assert_eq!(out.len(), 3);
    Ok(())
}

#[test]
fn atomic_write_test() -> anyhow::Result<()> {
    let out_file = create_temp_dir_file(".txt")?;
    let out_file = out_file.to_str().unwrap();

    let lines: Vec<Box<str>> = vec!["a\tb".into(), "c\td".into()];
    write_lines_atomic(&lines, out_file)?;

    let back = matrix_util::common_io::read_lines(out_file)?;
    assert_eq!(back, lines);

    // the scratch file must be gone after the rename
    assert!(!std::path::Path::new(part_file_path(out_file).as_ref()).exists());
    Ok(())
}
