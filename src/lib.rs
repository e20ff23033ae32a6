//! Least angle regression (LARS) with an optional LASSO modification.
//!
//! The solver fits `y ≈ X beta` by activating predictors one at a time: each
//! step moves the coefficients along the direction that keeps every active
//! predictor equally correlated with the residual, until another predictor
//! catches up (or, with LASSO, until an active coefficient reaches zero).
//!
//! How it works (high level):
//! - Correlations `c = X^T (y - mu)` are updated incrementally after each step.
//! - The Gram matrix of the active columns and its Cholesky factor are
//!   grown or shrunk by one row when a single predictor enters or leaves,
//!   with a full rebuild as the fallback.
//! - `G_A x = 1` is solved by Cholesky or, optionally, preconditioned
//!   conjugate gradient.
//! - Predictors that make the Gram matrix singular are excluded and the
//!   iteration reports failure.
//!
//! Calling it:
//! - Wrap the features in `DenseFeatures` or `SparseFeatures` (or implement
//!   `DesignMatrix` for your own storage).
//! - Build a `LarsSolver` and call `iteration` step by step or `run` to the end.
//! - Use `checkpoint`/`restart` to persist and resume the path.
//!
//! Example:
//! ```rust,no_run
//! use s_lars_rs::{DenseFeatures, LarsSolver, Response, SolverOptions};
//! use faer_core::Parallelism;
//!
//! let rows = vec![vec![1.0, 0.5], vec![-1.0, 0.25], vec![0.5, -1.0]];
//! let mut x = DenseFeatures::from_rows(&rows, Parallelism::None).unwrap();
//! x.normalize();
//! let y = Response::centered(vec![1.0, -0.8, 0.4]);
//! let mut solver = LarsSolver::new(x, y, SolverOptions::default(), Parallelism::None).unwrap();
//! let stats = solver.run(None).unwrap();
//! assert!(stats.objective.is_finite());
//! let model = solver.unscaled_coefficients().unwrap();
//! println!("{:?} + {}", model.coefficients, model.intercept);
//! ```

mod active;
mod cg;
mod checkpoint;
mod cholesky;
mod correlation;
mod features;
mod gram;
mod linear;
mod report;
mod solver;
mod sparse;
mod step;

pub use active::{ActiveSet, ActiveSetChange, ExcludeSet};
pub use cg::Preconditioner;
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointErrorKind};
pub use features::{ColumnScaling, DenseFeatures, DesignMatrix, FeatureError, Response};
pub use linear::{LinearSolver, SolvePath};
pub use report::{
    IterationReport, Reporter, SolveStatus, SolverStats, StdoutReporter, TrajectoryWriter,
};
pub use solver::{
    Algorithm, DirectionCheck, IterationStatus, LarsSolver, SolverError, SolverOptions,
    UnscaledModel,
};
pub use sparse::SparseFeatures;
