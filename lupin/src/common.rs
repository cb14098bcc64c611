pub type Mat = nalgebra::DMatrix<f64>;
pub type DVec = nalgebra::DVector<f64>;
pub type SpMat = nalgebra_sparse::CscMatrix<f64>;

/// Knuth-style multiplier for deterministic per-column RNG streams in
/// parallel sweeps.
pub const COLUMN_SEED_MIX: u64 = 2654435761;
