//! Dense and sparse matrix utilities shared across the workspace:
//! capability traits, gzip-aware delimited IO, random matrix
//! constructors, and multivariate-normal/Wishart samplers.

pub mod common_io;

pub mod traits;

pub mod dmatrix_util;

pub mod dmatrix_io;

pub mod csc_io;

pub mod mvnormal;
