use core::fmt;

use crate::active::ActiveSetChange;
use crate::cg::{self, Preconditioner, PreconditionerState};
use crate::cholesky::CholeskyFactor;
use crate::gram::GramMatrix;

/// Largest allowed `|(G x)_j - 1|` for an accepted solution.
pub(crate) const RESIDUAL_TOL: f64 = 1e-4;
const CG_TOL: f64 = 1e-8;
const CG_RESTART: usize = 10;
const CG_EXTRA_ITERS: usize = 10;
/// Incremental factor updates are only attempted above this size.
const MIN_INCREMENTAL_DIM: usize = 2;

/// Method used for the active-set system `G_A x = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LinearSolver {
    /// Cholesky factorization, updated incrementally when one predictor
    /// enters or leaves.
    #[default]
    Cholesky,
    /// Conjugate gradient, falling back to Cholesky on failure.
    ConjugateGradient {
        preconditioner: Option<Preconditioner>,
    },
}

/// How a successful solve was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvePath {
    ConjugateGradient,
    CholeskyAddRow,
    CholeskyRemoveRow,
    CholeskyFull,
}

/// Why a solve path was rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SolveFailure {
    /// Full decomposition failed: `G_A` is not positive definite.
    Singular { pivot: usize, value: f64 },
    /// Conjugate gradient did not converge.
    ConjugateGradient { iterations: usize, residual: f64 },
    /// Incremental add/remove of a factor row broke down.
    IncrementalUpdate { pivot: usize },
    /// A component of `G_A x - 1` exceeded the tolerance.
    Residual { component: usize, residual: f64 },
    /// `sum(x) <= 0`, so `A_A` is undefined.
    Normalization { sum: f64 },
}

impl fmt::Display for SolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Singular { pivot, value } => {
                write!(f, "Gram matrix not positive definite at pivot {pivot} ({value:.3e})")
            }
            Self::ConjugateGradient {
                iterations,
                residual,
            } => write!(
                f,
                "conjugate gradient failed after {iterations} iterations (residual {residual:.3e})"
            ),
            Self::IncrementalUpdate { pivot } => {
                write!(f, "incremental Cholesky update failed at pivot {pivot}")
            }
            Self::Residual {
                component,
                residual,
            } => write!(f, "solution test failed at component {component}: error {residual:.3e}"),
            Self::Normalization { sum } => {
                write!(f, "A_A normalization failed: sum(G_A^-1 1) = {sum:.3e}")
            }
        }
    }
}

/// Solves `G_A x = 1` and derives `A_A = (sum x)^(-1/2)`.
///
/// Keeps the Cholesky factor (and preconditioner) of the previous active set
/// so that single-index changes can be applied incrementally.
#[derive(Debug, Clone)]
pub(crate) struct GramSolver {
    method: LinearSolver,
    factor: Option<CholeskyFactor>,
    preconditioner: Option<PreconditionerState>,
    solution: Vec<f64>,
    a_a: f64,
    solve_succeeded: bool,
    quiet: bool,
}

impl GramSolver {
    pub(crate) fn new(method: LinearSolver, quiet: bool) -> Self {
        Self {
            method,
            factor: None,
            preconditioner: None,
            solution: Vec::new(),
            a_a: 0.0,
            solve_succeeded: true,
            quiet,
        }
    }

    /// `G_A^-1 * 1` from the last successful solve.
    pub(crate) fn solution(&self) -> &[f64] {
        &self.solution
    }

    /// Normalization `A_A` from the last successful solve.
    pub(crate) fn a_a(&self) -> f64 {
        self.a_a
    }

    /// Drop cached factorizations so the next solve starts from scratch.
    pub(crate) fn invalidate(&mut self) {
        self.factor = None;
        self.preconditioner = None;
        self.solve_succeeded = false;
    }

    /// Solve for the current Gram matrix.
    ///
    /// `change` describes how the active set moved since the previous solve;
    /// incremental factor updates are used only when `incremental` is set and
    /// the previous solve succeeded.
    pub(crate) fn solve(
        &mut self,
        gram: &GramMatrix,
        change: ActiveSetChange,
        incremental: bool,
    ) -> Result<SolvePath, SolveFailure> {
        let n = gram.dim();
        self.solution.resize(n, 0.0);

        if let LinearSolver::ConjugateGradient { preconditioner } = self.method {
            match self.solve_con_grad(gram, change, preconditioner) {
                Ok(()) => {
                    // The Cholesky factor no longer tracks the active set.
                    self.factor = None;
                    self.solve_succeeded = true;
                    return Ok(SolvePath::ConjugateGradient);
                }
                Err(err) => {
                    if !self.quiet {
                        log::warn!("{err}; trying Cholesky instead");
                    }
                }
            }
        }
        self.solve_cholesky(gram, change, incremental)
    }

    /// Cholesky-only solve: incremental row update when possible, else a full
    /// decomposition.
    pub(crate) fn solve_cholesky(
        &mut self,
        gram: &GramMatrix,
        change: ActiveSetChange,
        incremental: bool,
    ) -> Result<SolvePath, SolveFailure> {
        let n = gram.dim();
        self.solution.resize(n, 0.0);

        if incremental && self.solve_succeeded && n > MIN_INCREMENTAL_DIM {
            match self.try_incremental(gram, change) {
                Some(Ok(path)) => return Ok(path),
                Some(Err(err)) => {
                    if !self.quiet {
                        log::warn!("{err}; will perform a non-incremental decomposition");
                    }
                }
                None => {}
            }
        }

        let factor = match CholeskyFactor::factorize(gram) {
            Ok(factor) => factor,
            Err(err) => {
                self.invalidate();
                return Err(SolveFailure::Singular {
                    pivot: err.pivot,
                    value: err.value,
                });
            }
        };
        let result = self.back_substitute(gram, &factor);
        self.solve_succeeded = result.is_ok();
        self.factor = result.is_ok().then_some(factor);
        result.map(|()| SolvePath::CholeskyFull)
    }

    /// Attempt a factor row add/remove; `None` when not applicable.
    fn try_incremental(
        &mut self,
        gram: &GramMatrix,
        change: ActiveSetChange,
    ) -> Option<Result<SolvePath, SolveFailure>> {
        let n = gram.dim();
        let previous = self.factor.as_ref()?;
        let (updated, path) = match change {
            ActiveSetChange::Added { position, .. }
                if position + 1 == n && previous.dim() + 1 == n =>
            {
                let mut factor = previous.clone();
                let updated = factor.add_row(gram.row(n - 1)).map(|()| factor);
                (updated, SolvePath::CholeskyAddRow)
            }
            ActiveSetChange::Removed { position, .. } if previous.dim() == n + 1 => {
                let mut factor = previous.clone();
                let updated = factor.remove_row(position).map(|()| factor);
                (updated, SolvePath::CholeskyRemoveRow)
            }
            _ => return None,
        };
        let factor = match updated {
            Ok(factor) => factor,
            Err(err) => return Some(Err(SolveFailure::IncrementalUpdate { pivot: err.pivot })),
        };
        let result = self.back_substitute(gram, &factor).map(|()| path);
        if result.is_ok() {
            self.factor = Some(factor);
            self.solve_succeeded = true;
        }
        Some(result)
    }

    /// Solve through `factor` and validate the result.
    fn back_substitute(
        &mut self,
        gram: &GramMatrix,
        factor: &CholeskyFactor,
    ) -> Result<(), SolveFailure> {
        let unity = vec![1.0; gram.dim()];
        factor.solve(&unity, &mut self.solution);
        self.validate(gram)
    }

    fn solve_con_grad(
        &mut self,
        gram: &GramMatrix,
        change: ActiveSetChange,
        preconditioner: Option<Preconditioner>,
    ) -> Result<(), SolveFailure> {
        let n = gram.dim();
        let state = match preconditioner {
            None => PreconditionerState::Identity,
            Some(kind) => self.refresh_preconditioner(kind, gram, change),
        };
        let unity = vec![1.0; n];
        self.solution.fill(0.0);
        cg::solve(
            gram,
            &unity,
            &mut self.solution,
            &state,
            n + CG_EXTRA_ITERS,
            CG_RESTART,
            CG_TOL,
        )
        .map_err(|err| SolveFailure::ConjugateGradient {
            iterations: err.iterations,
            residual: err.residual,
        })?;
        self.validate(gram)
    }

    fn refresh_preconditioner(
        &mut self,
        kind: Preconditioner,
        gram: &GramMatrix,
        change: ActiveSetChange,
    ) -> PreconditionerState {
        let n = gram.dim();
        let grown = matches!(kind, Preconditioner::CholeskyInverse)
            && matches!(change, ActiveSetChange::Added { position, .. } if position + 1 == n)
            && n > MIN_INCREMENTAL_DIM
            && self.preconditioner.as_mut().is_some_and(|p| p.grow(n));
        if !grown {
            self.preconditioner = Some(PreconditionerState::compute(kind, gram, self.quiet));
        }
        self.preconditioner
            .clone()
            .unwrap_or(PreconditionerState::Identity)
    }

    /// Rebuild the preconditioner from scratch (used after a restart).
    pub(crate) fn reset_preconditioner(&mut self, gram: &GramMatrix) {
        self.preconditioner = match self.method {
            LinearSolver::ConjugateGradient {
                preconditioner: Some(kind),
            } => Some(PreconditionerState::compute(kind, gram, self.quiet)),
            _ => None,
        };
    }

    /// Check `G x = 1` componentwise and compute `A_A`.
    fn validate(&mut self, gram: &GramMatrix) -> Result<(), SolveFailure> {
        let n = gram.dim();
        let mut test = vec![0.0; n];
        gram.mul_vec(&self.solution, &mut test);
        let mut total = 0.0;
        for (component, &v) in test.iter().enumerate() {
            let residual = (v - 1.0).abs();
            if !(residual <= RESIDUAL_TOL) {
                return Err(SolveFailure::Residual {
                    component,
                    residual,
                });
            }
            total += residual;
        }
        if n > 0 && !self.quiet {
            log::debug!("solution error test = {:.3e}", total / n as f64);
        }

        let sum: f64 = self.solution.iter().sum();
        if !(sum > 0.0) {
            return Err(SolveFailure::Normalization { sum });
        }
        self.a_a = 1.0 / sum.sqrt();
        Ok(())
    }
}
