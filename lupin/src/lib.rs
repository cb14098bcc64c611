//! Bayesian matrix factorization by Gibbs sampling.
//!
//! Decomposes a partially-observed matrix `Y` into low-rank latent
//! factors, one factor matrix per mode (rows, columns), optionally
//! informed by per-entity side-information features through a learned
//! link matrix. Posterior inference is alternating-conditional Gibbs
//! sampling: per-column conditional Gaussian draws, Normal-Wishart
//! hyperparameter resampling, and (for link priors) a ridge-regression
//! resample of the link matrix each iteration.
//!
//! # Priors
//!
//! * [`priors::NormalPrior`] - Normal-Wishart, no side information (BPMF)
//! * [`priors::LinkPrior`] - side-information regression, direct Cholesky
//!   or block conjugate-gradient solver
//! * [`priors::LinkOnePrior`] - per-dimension regularization, feature-wise
//!   coordinate updates for very wide feature matrices
//! * [`priors::SpikeAndSlabPrior`] - sparsity-inducing mixture prior

/// shared scalar/matrix type aliases
pub mod common;

/// latent factor matrices, prediction, sub-block views
pub mod model;

/// observed-data views: dense, sparse, scarce, scarce-binary
pub mod data;

/// per-observation precision models
pub mod noise;

/// side-information feature matrices: dense, sparse, sparse-binary
pub mod side_info;

/// Cholesky and block conjugate-gradient regression solvers
pub mod linsolve;

/// the latent-prior family
pub mod priors;

/// held-out evaluation: RMSE and AUC
pub mod result;

/// burn-in/sampling loop with checkpointing
pub mod session;

/// checkpoint file layout
pub mod checkpoint;

/// feature partitioning across workers
pub mod distributed;

/// `lupin train` entry point
pub mod run_train;

/// `lupin predict` entry point
pub mod run_predict;
