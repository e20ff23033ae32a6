use core::fmt;

use std::time::{Duration, Instant};

use faer_core::Parallelism;

use crate::active::{ActiveSet, ActiveSetChange, ExcludeSet};
use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::correlation::Correlation;
use crate::features::{DesignMatrix, FeatureError, Response};
use crate::gram::{dot, ActiveDesign, GramMatrix};
use crate::linear::{GramSolver, LinearSolver, SolvePath};
use crate::report::{
    emit_line, IterationReport, Reporter, SolveStatus, SolverStats, StdoutReporter,
};
use crate::step::StepState;

/// Largest accepted deviation in the equiangular direction checks.
const DIRECTION_TOL: f64 = 1e-4;

/// Errors that abort a run.
#[derive(Debug)]
pub enum SolverError {
    /// The feature matrix has zero rows or columns.
    InvalidDimensions { nrows: usize, ncols: usize },
    /// A vector does not match the number of observations.
    DimensionMismatch { expected: usize, actual: usize },
    /// The equiangular direction failed a consistency check.
    DirectionValidation { check: DirectionCheck, value: f64 },
    /// A coefficient scheduled for removal did not reach zero.
    LassoConsistency { index: usize, value: f64 },
    /// A checkpoint could not be replayed.
    Restart(CheckpointError),
    /// Coefficients cannot be unscaled for a column with zero scale.
    ZeroScale { column: usize },
    /// Invalid feature storage.
    Features(FeatureError),
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDimensions { nrows, ncols } => {
                write!(f, "invalid dimensions: nrows={nrows}, ncols={ncols}")
            }
            Self::DimensionMismatch { expected, actual } => {
                write!(f, "vector length {actual} does not match expected {expected}")
            }
            Self::DirectionValidation { check, value } => {
                write!(f, "direction check failed: {check} (observed {value:.6e})")
            }
            Self::LassoConsistency { index, value } => {
                write!(
                    f,
                    "coefficient {index} should be zero after LASSO step but is {value:.6e}"
                )
            }
            Self::Restart(err) => write!(f, "restart failed: {err}"),
            Self::ZeroScale { column } => write!(f, "column {column} has zero scale"),
            Self::Features(err) => write!(f, "invalid features: {err}"),
        }
    }
}

impl std::error::Error for SolverError {}

impl From<CheckpointError> for SolverError {
    fn from(err: CheckpointError) -> Self {
        Self::Restart(err)
    }
}

impl From<FeatureError> for SolverError {
    fn from(err: FeatureError) -> Self {
        Self::Features(err)
    }
}

/// Which equiangular direction check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionCheck {
    /// `||u_A|| = 1`.
    UnitNorm,
    /// `X_A^T u_A = A_A * 1`.
    Equiangular,
}

impl fmt::Display for DirectionCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnitNorm => write!(f, "||u_A|| = 1"),
            Self::Equiangular => write!(f, "X_A^T u_A = A_A"),
        }
    }
}

/// Path variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Plain least angle regression; predictors are only ever added.
    #[default]
    Lars,
    /// LASSO modification: a predictor leaves when its coefficient crosses zero.
    Lasso,
}

/// Options controlling the LARS/LASSO path.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub algorithm: Algorithm,
    /// L1 weight in the reported objective.
    pub lambda: f64,
    pub linear_solver: LinearSolver,
    /// Update the Gram matrix and Cholesky factor incrementally when one
    /// predictor enters or leaves.
    pub incremental_updates: bool,
    /// Maximum number of iterations for `run`.
    pub max_iters: usize,
    /// `run` stops once `C_max <= correlation_tol`.
    pub correlation_tol: f64,
    /// Print an iteration table and wall time at the end of `run`.
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Lars,
            lambda: 0.0,
            linear_solver: LinearSolver::Cholesky,
            incremental_updates: true,
            max_iters: 1000,
            correlation_tol: 1e-12,
            verbose: false,
        }
    }
}

/// Outcome of a single iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationStatus {
    /// No further predictor can be activated.
    Exhausted,
    /// A step was taken.
    Stepped,
    /// The active-set system could not be solved; `excluded` were disabled
    /// and the active set rolled back.
    Failed { excluded: Vec<usize> },
}

impl IterationStatus {
    /// Integer status: 0 exhausted, 1 stepped, -1 failed.
    pub fn code(&self) -> i32 {
        match self {
            Self::Exhausted => 0,
            Self::Stepped => 1,
            Self::Failed { .. } => -1,
        }
    }
}

/// Coefficients in the units of the unscaled features.
#[derive(Debug, Clone, PartialEq)]
pub struct UnscaledModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

/// Whether a cached vector reflects the coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    /// Must be recomputed with a full matrix product.
    Stale,
    Current,
    /// The last step has not been applied yet.
    PendingStep,
}

enum ReporterSlot<'a> {
    External(&'a mut dyn Reporter),
    Local(StdoutReporter),
    None,
}

impl<'a> ReporterSlot<'a> {
    fn new(reporter: Option<&'a mut dyn Reporter>, verbose: bool) -> Self {
        match reporter {
            Some(r) => Self::External(r),
            None if verbose => Self::Local(StdoutReporter::new()),
            None => Self::None,
        }
    }

    fn as_mut(&mut self) -> Option<&mut dyn Reporter> {
        match self {
            Self::External(r) => Some(*r),
            Self::Local(r) => Some(r),
            Self::None => None,
        }
    }
}

/// Least angle regression over a feature matrix `X` (`ndata x nprops`).
///
/// Each call to [`LarsSolver::iteration`] moves the coefficients along the
/// equiangular direction of the active predictors until another predictor
/// reaches the same absolute correlation with the residual (or, in LASSO
/// mode, until an active coefficient crosses zero).
pub struct LarsSolver<M: DesignMatrix> {
    matrix: M,
    response: Response,
    options: SolverOptions,
    parallelism: Parallelism,
    coordinator: bool,
    beta: Vec<f64>,
    mu: Vec<f64>,
    mu_state: Freshness,
    correlation: Correlation,
    correlation_state: Freshness,
    active: ActiveSet,
    exclude: ExcludeSet,
    design: ActiveDesign,
    gram: GramMatrix,
    linear: GramSolver,
    solve_path: Option<SolvePath>,
    steps: StepState,
    w_a: Vec<f64>,
    u_a: Vec<f64>,
    a: Vec<f64>,
    a_a: f64,
    objective: f64,
    iterations: usize,
}

impl<M: DesignMatrix> LarsSolver<M> {
    /// Create a solver starting from `beta = 0`.
    ///
    /// `parallelism` applies to products with the active columns.
    pub fn new(
        matrix: M,
        response: Response,
        options: SolverOptions,
        parallelism: Parallelism,
    ) -> Result<Self, SolverError> {
        let ndata = matrix.nrows();
        let nprops = matrix.ncols();
        if ndata == 0 || nprops == 0 {
            return Err(SolverError::InvalidDimensions {
                nrows: ndata,
                ncols: nprops,
            });
        }
        if response.len() != ndata {
            return Err(SolverError::DimensionMismatch {
                expected: ndata,
                actual: response.len(),
            });
        }

        let coordinator = matrix.is_coordinator();
        let linear = GramSolver::new(options.linear_solver, !coordinator);
        Ok(Self {
            matrix,
            response,
            options,
            parallelism,
            coordinator,
            beta: vec![0.0; nprops],
            mu: vec![0.0; ndata],
            mu_state: Freshness::Stale,
            correlation: Correlation::new(nprops),
            correlation_state: Freshness::Stale,
            active: ActiveSet::new(),
            exclude: ExcludeSet::new(nprops),
            design: ActiveDesign::new(ndata),
            gram: GramMatrix::new(parallelism),
            linear,
            solve_path: None,
            steps: StepState::default(),
            w_a: Vec::new(),
            u_a: vec![0.0; ndata],
            a: vec![0.0; nprops],
            a_a: 0.0,
            objective: 0.0,
            iterations: 0,
        })
    }

    pub fn matrix(&self) -> &M {
        &self.matrix
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Coefficients in the scaled feature space.
    pub fn beta(&self) -> &[f64] {
        &self.beta
    }

    pub fn active_set(&self) -> &ActiveSet {
        &self.active
    }

    pub fn excluded(&self) -> &ExcludeSet {
        &self.exclude
    }

    /// Prediction as of the last `predict`; the step taken by the most recent
    /// iteration is applied by the next `predict`.
    pub fn prediction(&self) -> &[f64] {
        &self.mu
    }

    /// Prediction consistent with the current coefficients.
    pub fn settled_prediction(&self) -> Vec<f64> {
        match self.mu_state {
            Freshness::Current => self.mu.clone(),
            Freshness::PendingStep => self
                .mu
                .iter()
                .zip(&self.u_a)
                .map(|(m, u)| m + self.steps.gamma_use * u)
                .collect(),
            Freshness::Stale => {
                let mut mu = vec![0.0; self.mu.len()];
                self.matrix.mul_vec(&self.beta, &mut mu);
                mu
            }
        }
    }

    /// Correlations `X^T (y - mu)` from the last iteration.
    pub fn correlations(&self) -> &[f64] {
        self.correlation.values()
    }

    /// Largest admissible absolute correlation from the last iteration.
    pub fn max_correlation(&self) -> f64 {
        self.correlation.c_max()
    }

    /// Equiangular normalization `A_A`.
    pub fn normalization(&self) -> f64 {
        self.a_a
    }

    /// LARS step length of the last iteration.
    pub fn step_size(&self) -> f64 {
        self.steps.gamma
    }

    /// Step at which an active coefficient crosses zero (LASSO only).
    pub fn gamma_lasso(&self) -> f64 {
        self.steps.gamma_lasso
    }

    /// Step actually applied by the last iteration.
    pub fn gamma_use(&self) -> f64 {
        self.steps.gamma_use
    }

    /// Equiangular unit direction `u_A` in observation space.
    pub fn direction(&self) -> &[f64] {
        &self.u_a
    }

    /// How the active-set system was solved in the last iteration.
    pub fn solve_path(&self) -> Option<SolvePath> {
        self.solve_path
    }

    /// Iterations started so far, including failed ones.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Objective computed at the start of the last iteration (or restart).
    pub fn objective(&self) -> f64 {
        self.objective
    }

    /// Bring `mu` up to date: the pending step is applied incrementally,
    /// a stale prediction is recomputed in full.
    pub fn predict(&mut self) {
        match self.mu_state {
            Freshness::Stale => self.predict_all(),
            Freshness::PendingStep => {
                for (m, u) in self.mu.iter_mut().zip(&self.u_a) {
                    *m += self.steps.gamma_use * u;
                }
                self.mu_state = Freshness::Current;
            }
            Freshness::Current => {}
        }
    }

    /// `mu = X beta`.
    pub fn predict_all(&mut self) {
        self.matrix.mul_vec(&self.beta, &mut self.mu);
        self.mu_state = Freshness::Current;
    }

    /// `sum (y - mu)^2` for the current prediction.
    pub fn squared_error(&self) -> f64 {
        squared_error(self.response.values(), &self.mu)
    }

    pub fn rms_error(&self) -> f64 {
        (self.squared_error() / self.mu.len() as f64).sqrt()
    }

    pub fn l1_norm(&self) -> f64 {
        self.beta.iter().map(|b| b.abs()).sum()
    }

    fn objective_for(&self, squared_error: f64) -> f64 {
        0.5 * squared_error / self.mu.len() as f64 + self.options.lambda * self.l1_norm()
    }

    /// Perform one LARS/LASSO iteration.
    pub fn iteration(&mut self) -> Result<IterationStatus, SolverError> {
        self.advance(None)
    }

    /// Like [`LarsSolver::iteration`], reporting progress to `reporter`.
    pub fn iterate_with(
        &mut self,
        reporter: &mut dyn Reporter,
    ) -> Result<IterationStatus, SolverError> {
        self.advance(Some(reporter))
    }

    fn advance(
        &mut self,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<IterationStatus, SolverError> {
        if self.active.len() >= self.beta.len() - self.exclude.len() {
            return Ok(IterationStatus::Exhausted);
        }
        let mut reporter = if self.coordinator { reporter } else { None };

        self.iterations += 1;
        self.predict();
        let squared_error = self.squared_error();
        self.objective = self.objective_for(squared_error);
        if let Some(reporter) = reporter.as_deref_mut() {
            // The counter already includes the iteration in progress.
            reporter.on_checkpoint(&self.checkpoint_labelled(self.iterations));
        }
        let mut report = IterationReport {
            iteration: self.iterations,
            objective: self.objective,
            rms_error: (squared_error / self.mu.len() as f64).sqrt(),
            l1_norm: self.l1_norm(),
            nactive: 0,
            max_correlation: 0.0,
            gamma_use: 0.0,
            lasso_limited: false,
            added: None,
            removed: None,
            excluded: Vec::new(),
        };

        self.update_correlation();
        report.max_correlation = self.correlation.c_max();

        let change = self.update_active_set();
        match change {
            ActiveSetChange::Added { index, .. } => report.added = Some(index),
            ActiveSetChange::Removed { index, .. } => report.removed = Some(index),
            _ => {}
        }
        report.nactive = self.active.len();

        self.design
            .rebuild(&self.matrix, self.active.indices(), self.correlation.values());
        self.gram.update(&self.design, change);

        match self
            .linear
            .solve(&self.gram, change, self.options.incremental_updates)
        {
            Ok(path) => {
                self.solve_path = Some(path);
                if self.coordinator {
                    let n = self.gram.dim();
                    log::debug!("solved {n} x {n} G_A via {path:?}");
                }
            }
            Err(failure) => {
                self.solve_path = None;
                let excluded = self.recover();
                if self.coordinator {
                    log::warn!(
                        "iteration {} failed: {failure}; excluding {excluded:?}",
                        self.iterations
                    );
                }
                report.excluded.clone_from(&excluded);
                report.nactive = self.active.len();
                if let Some(reporter) = reporter.as_deref_mut() {
                    reporter.on_iteration(&report);
                }
                return Ok(IterationStatus::Failed { excluded });
            }
        }
        self.a_a = self.linear.a_a();

        self.build_direction()?;
        self.update_step()?;

        report.gamma_use = self.steps.gamma_use;
        report.lasso_limited = self.steps.lasso_limited(self.lasso());
        if let Some(reporter) = reporter.as_deref_mut() {
            reporter.on_iteration(&report);
        }
        Ok(IterationStatus::Stepped)
    }

    fn lasso(&self) -> bool {
        self.options.algorithm == Algorithm::Lasso
    }

    /// Full product on the first call (and after a restart or failure),
    /// `c -= gamma_use * a` afterwards.
    fn update_correlation(&mut self) {
        match self.correlation_state {
            Freshness::PendingStep => {
                self.correlation
                    .advance(self.steps.gamma_use, &self.a, &self.exclude);
            }
            Freshness::Stale => {
                self.correlation
                    .recompute(&self.matrix, self.response.values(), &self.mu, &self.exclude);
            }
            Freshness::Current => {}
        }
        self.correlation_state = Freshness::Current;
    }

    fn update_active_set(&mut self) -> ActiveSetChange {
        let pending = self.steps.take_pending(self.lasso());
        self.active.update(
            pending,
            self.correlation.values(),
            self.correlation.c_max(),
            &self.exclude,
        );

        let mut indices = self.active.snapshot();
        self.matrix.broadcast_indices(&mut indices);
        let change = self.active.replace(indices);

        if self.coordinator {
            match change {
                ActiveSetChange::Added { index, .. } => {
                    log::info!("adding index {index} to the active set")
                }
                ActiveSetChange::Removed { index, .. } => {
                    log::info!("removing index {index} from the active set")
                }
                _ => {}
            }
        }
        change
    }

    /// Exclude the predictors added this iteration and return to `A_last`.
    fn recover(&mut self) -> Vec<usize> {
        let excluded = self.active.newly_added();
        for &j in &excluded {
            self.exclude.insert(j);
        }
        self.active.roll_back();
        self.gram.invalidate();
        self.linear.invalidate();
        self.steps.reset();
        // C_max must be re-taken over the reduced pool.
        self.correlation_state = Freshness::Stale;
        excluded
    }

    /// `w_A = A_A G_A^-1 1`, `u_A = X_A w_A`, `a = X^T u_A`.
    fn build_direction(&mut self) -> Result<(), SolverError> {
        let a_a = self.a_a;
        self.w_a.clear();
        self.w_a
            .extend(self.linear.solution().iter().map(|x| a_a * x));
        self.design.mul_vec(&self.w_a, &mut self.u_a, self.parallelism);

        let norm = dot(&self.u_a, &self.u_a).sqrt();
        if !((norm - 1.0).abs() <= DIRECTION_TOL) {
            return Err(self.direction_failure(DirectionCheck::UnitNorm, norm));
        }

        let mut projection = vec![0.0; self.design.len()];
        self.design
            .mul_transpose_vec(&self.u_a, &mut projection, self.parallelism);
        if let Some(&value) = projection
            .iter()
            .find(|&&v| !((v - a_a).abs() <= DIRECTION_TOL))
        {
            return Err(self.direction_failure(DirectionCheck::Equiangular, value));
        }

        self.matrix.mul_transpose_vec(&self.u_a, &mut self.a);
        Ok(())
    }

    fn direction_failure(&self, check: DirectionCheck, value: f64) -> SolverError {
        if self.coordinator {
            log::error!("direction check {check} failed: {value:.6e}");
        }
        SolverError::DirectionValidation { check, value }
    }

    fn update_step(&mut self) -> Result<(), SolverError> {
        let lasso = self.lasso();
        self.steps.update_step_gamma(
            self.correlation.values(),
            self.correlation.c_max(),
            &self.a,
            self.a_a,
            &self.active,
            &self.exclude,
        );
        if lasso {
            self.steps.update_lasso_gamma(
                &self.beta,
                self.active.indices(),
                self.design.signs(),
                &self.w_a,
            );
            if self.coordinator && self.steps.lasso_limited(true) {
                log::info!(
                    "LASSO step {:.6e} shorter than LARS step {:.6e}",
                    self.steps.gamma_lasso,
                    self.steps.gamma
                );
            }
        }

        let step = self
            .steps
            .update_beta(
                &mut self.beta,
                lasso,
                self.active.indices(),
                self.design.signs(),
                &self.w_a,
            )
            .map_err(|v| SolverError::LassoConsistency {
                index: v.index,
                value: v.value,
            })?;
        self.matrix.broadcast_values(&mut self.beta);
        if self.coordinator {
            if let Some(index) = step.removed {
                log::debug!("coefficient {index} set to zero");
            }
        }

        self.mu_state = Freshness::PendingStep;
        self.correlation_state = Freshness::PendingStep;
        Ok(())
    }

    /// Repeat [`LarsSolver::iteration`] until the path ends.
    pub fn run(&mut self, reporter: Option<&mut dyn Reporter>) -> Result<SolverStats, SolverError> {
        let verbose = self.options.verbose && self.coordinator;
        let start_time = verbose.then(Instant::now);
        let mut reporter = ReporterSlot::new(reporter, verbose);

        let mut status = SolveStatus::MaxIterations;
        let mut failures = 0;
        for _ in 0..self.options.max_iters {
            match self.advance(reporter.as_mut())? {
                IterationStatus::Exhausted => {
                    status = SolveStatus::Exhausted;
                    break;
                }
                IterationStatus::Stepped => {
                    failures = 0;
                    if self.correlation.c_max() <= self.options.correlation_tol {
                        status = SolveStatus::Converged;
                        break;
                    }
                }
                IterationStatus::Failed { .. } => {
                    failures += 1;
                    if failures >= 2 {
                        status = SolveStatus::RepeatedFailure;
                        break;
                    }
                }
            }
        }

        let stats = SolverStats {
            status,
            iterations: self.iterations,
            objective: self.objective,
            nactive: self.active.len(),
            max_correlation: self.correlation.c_max(),
        };
        Ok(finish_stats(stats, start_time, &mut reporter, self.coordinator))
    }

    /// Settled state labelled with the iteration about to run.
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint_labelled(self.iterations + 1)
    }

    fn checkpoint_labelled(&self, iteration: usize) -> Checkpoint {
        let mu = self.settled_prediction();
        let squared_error = squared_error(self.response.values(), &mu);
        Checkpoint {
            iteration,
            l1_norm: self.l1_norm(),
            rms_error: (squared_error / mu.len() as f64).sqrt(),
            objective: self.objective_for(squared_error),
            nactive: self.active.len(),
            coefficients: nonzero(&self.beta),
            exclude: Some(self.exclude.iter().collect()),
            mu: Some(nonzero(&mu)),
        }
    }

    /// Replay `checkpoint` and re-derive the active-set system.
    ///
    /// The active set becomes the nonzero coefficients in index order. Returns
    /// the number of completed iterations.
    pub fn restart(&mut self, checkpoint: &Checkpoint) -> Result<usize, SolverError> {
        let nprops = self.beta.len();
        let ndata = self.mu.len();

        let mut beta = vec![0.0; nprops];
        for &(j, v) in &checkpoint.coefficients {
            *beta
                .get_mut(j)
                .ok_or(CheckpointError::out_of_range(j, nprops))? = v;
        }
        let mut exclude = ExcludeSet::new(nprops);
        for &j in checkpoint.exclude.iter().flatten() {
            if j >= nprops {
                return Err(CheckpointError::out_of_range(j, nprops).into());
            }
            if beta[j] != 0.0 {
                return Err(CheckpointError::excluded_coefficient(j).into());
            }
            exclude.insert(j);
        }
        let mu = match &checkpoint.mu {
            Some(entries) => {
                let mut mu = vec![0.0; ndata];
                for &(i, v) in entries {
                    *mu.get_mut(i)
                        .ok_or(CheckpointError::out_of_range(i, ndata))? = v;
                }
                Some(mu)
            }
            None => None,
        };

        self.beta = beta;
        self.exclude = exclude;
        let indices: Vec<usize> = (0..nprops).filter(|&j| self.beta[j] != 0.0).collect();
        self.active.reset(indices);
        self.iterations = checkpoint.iteration.saturating_sub(1);
        self.steps.reset();
        match mu {
            Some(mu) => {
                self.mu = mu;
                self.mu_state = Freshness::Current;
            }
            None => self.predict_all(),
        }
        self.objective = self.objective_for(self.squared_error());

        self.correlation_state = Freshness::Stale;
        self.update_correlation();
        self.design
            .rebuild(&self.matrix, self.active.indices(), self.correlation.values());
        self.gram.invalidate();
        self.gram.update(&self.design, ActiveSetChange::Rebuild);
        self.linear.invalidate();
        match self
            .linear
            .solve_cholesky(&self.gram, ActiveSetChange::Rebuild, false)
        {
            Ok(path) => {
                self.solve_path = Some(path);
                self.a_a = self.linear.a_a();
            }
            Err(failure) => {
                self.solve_path = None;
                if self.coordinator {
                    log::warn!("restart decomposition failed: {failure}");
                }
            }
        }
        self.linear.reset_preconditioner(&self.gram);

        if self.coordinator {
            log::info!(
                "restarted at iteration {} with {} active, objective {:.6e}",
                checkpoint.iteration,
                self.active.len(),
                self.objective
            );
        }
        Ok(self.iterations)
    }

    /// Coefficients and intercept for the unscaled, unshifted features.
    pub fn unscaled_coefficients(&self) -> Result<UnscaledModel, SolverError> {
        let mut intercept = self.response.shift();
        let mut coefficients = Vec::with_capacity(self.beta.len());
        for (column, &b) in self.beta.iter().enumerate() {
            let scaling = self.matrix.column_scaling(column);
            if scaling.scale == 0.0 {
                return Err(SolverError::ZeroScale { column });
            }
            let coefficient = b / scaling.scale;
            intercept -= coefficient * scaling.shift;
            coefficients.push(coefficient);
        }
        Ok(UnscaledModel {
            coefficients,
            intercept,
        })
    }

    /// Settled prediction with the response shift added back.
    pub fn unshifted_predictions(&self) -> Vec<f64> {
        let shift = self.response.shift();
        let mut mu = self.settled_prediction();
        for m in &mut mu {
            *m += shift;
        }
        mu
    }

    /// [`LarsSolver::unshifted_predictions`] divided by per-observation weights.
    pub fn unshifted_predictions_weighted(&self, weights: &[f64]) -> Result<Vec<f64>, SolverError> {
        if weights.len() != self.mu.len() {
            return Err(SolverError::DimensionMismatch {
                expected: self.mu.len(),
                actual: weights.len(),
            });
        }
        let mut mu = self.unshifted_predictions();
        for (m, w) in mu.iter_mut().zip(weights) {
            *m /= w;
        }
        Ok(mu)
    }
}

fn squared_error(y: &[f64], mu: &[f64]) -> f64 {
    y.iter().zip(mu).map(|(y, m)| (y - m) * (y - m)).sum()
}

fn nonzero(values: &[f64]) -> Vec<(usize, f64)> {
    values
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v != 0.0)
        .map(|(j, &v)| (j, v))
        .collect()
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}

fn finish_stats(
    stats: SolverStats,
    start_time: Option<Instant>,
    reporter: &mut ReporterSlot<'_>,
    coordinator: bool,
) -> SolverStats {
    if coordinator {
        if let Some(reporter) = reporter.as_mut() {
            reporter.on_finish();
        }
    }
    if let Some(start) = start_time {
        let elapsed = format_duration(start.elapsed());
        emit_line(&format!("time: {elapsed}"));
    }
    stats
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::checkpoint::CheckpointErrorKind;
    use crate::features::{ColumnScaling, DenseFeatures};
    use crate::gram::tests::features;

    fn solver(options: SolverOptions) -> LarsSolver<DenseFeatures> {
        let mut x = features(20, 5);
        x.normalize();
        let y: Vec<f64> = (0..20)
            .map(|i| 1.5 * x.column(2)[i] - 0.7 * x.column(4)[i] + 0.05 * (i as f64).sin())
            .collect();
        LarsSolver::new(x, Response::centered(y), options, Parallelism::None).unwrap()
    }

    #[test]
    fn rejects_mismatched_response() {
        let x = features(6, 2);
        let err = LarsSolver::new(
            x,
            Response::new(vec![0.0; 5]),
            SolverOptions::default(),
            Parallelism::None,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            SolverError::DimensionMismatch {
                expected: 6,
                actual: 5
            }
        ));
    }

    #[test]
    fn status_codes() {
        assert_eq!(IterationStatus::Exhausted.code(), 0);
        assert_eq!(IterationStatus::Stepped.code(), 1);
        assert_eq!(IterationStatus::Failed { excluded: vec![2] }.code(), -1);
    }

    #[test]
    fn first_iteration_activates_largest_correlation() {
        let mut s = solver(SolverOptions::default());
        assert_eq!(s.iteration().unwrap(), IterationStatus::Stepped);
        let c = s.correlations();
        let best = (0..c.len())
            .max_by(|&i, &j| c[i].abs().total_cmp(&c[j].abs()))
            .unwrap();
        assert_eq!(s.active_set().indices(), &[best]);
        assert!((s.max_correlation() - c[best].abs()).abs() <= 1e-12);
        assert!(s.gamma_use() > 0.0);
    }

    #[test]
    fn objective_decreases_along_path() {
        let mut s = solver(SolverOptions::default());
        let mut last = f64::INFINITY;
        for _ in 0..4 {
            assert_eq!(s.iteration().unwrap(), IterationStatus::Stepped);
            assert!(s.objective() <= last + 1e-12);
            last = s.objective();
        }
    }

    #[test]
    fn settled_prediction_matches_full_product() {
        let mut s = solver(SolverOptions::default());
        s.iteration().unwrap();
        s.iteration().unwrap();
        let settled = s.settled_prediction();
        s.predict_all();
        for (a, b) in settled.iter().zip(s.prediction()) {
            assert!((a - b).abs() <= 1e-10);
        }
    }

    #[test]
    fn lambda_adds_l1_penalty_to_objective() {
        let mut plain = solver(SolverOptions::default());
        let mut penalized = solver(SolverOptions {
            lambda: 0.25,
            ..SolverOptions::default()
        });
        for _ in 0..3 {
            plain.iteration().unwrap();
            penalized.iteration().unwrap();
        }
        let plain_cp = plain.checkpoint();
        let penalized_cp = penalized.checkpoint();
        assert_eq!(plain_cp.coefficients, penalized_cp.coefficients);
        let expected = plain_cp.objective + 0.25 * plain.l1_norm();
        assert!((penalized_cp.objective - expected).abs() <= 1e-12);
    }

    #[test]
    fn unscaled_output_uses_column_scaling() {
        let mut x = features(12, 3);
        x.normalize();
        let scaling: Vec<_> = (0..3).map(|j| x.column_scaling(j)).collect();
        let y: Vec<f64> = (0..12).map(|i| x.column(1)[i] * 2.0 + 0.5).collect();
        let response = Response::centered(y);
        let mut s =
            LarsSolver::new(x, response, SolverOptions::default(), Parallelism::None).unwrap();
        s.iteration().unwrap();
        let model = s.unscaled_coefficients().unwrap();
        let mut intercept = 0.5;
        for j in 0..3 {
            let expected = s.beta()[j] / scaling[j].scale;
            assert!((model.coefficients[j] - expected).abs() <= 1e-12);
            intercept -= expected * scaling[j].shift;
        }
        assert!((model.intercept - intercept).abs() <= 1e-12);

        let predictions = s.unshifted_predictions();
        let settled = s.settled_prediction();
        assert!((predictions[3] - settled[3] - 0.5).abs() <= 1e-12);
        assert!(s.unshifted_predictions_weighted(&[1.0; 4]).is_err());
    }

    /// Columns grow by half their size every time they are fetched, so the
    /// cached Gram entries disagree with freshly built `X_A` columns.
    struct DriftingColumns {
        inner: DenseFeatures,
        fetches: Cell<usize>,
    }

    impl DesignMatrix for DriftingColumns {
        fn nrows(&self) -> usize {
            self.inner.nrows()
        }

        fn ncols(&self) -> usize {
            self.inner.ncols()
        }

        fn column_scaling(&self, col: usize) -> ColumnScaling {
            self.inner.column_scaling(col)
        }

        fn column_into(&self, col: usize, out: &mut [f64]) {
            let fetch = self.fetches.get();
            self.fetches.set(fetch + 1);
            self.inner.column_into(col, out);
            let factor = 1.0 + 0.5 * fetch as f64;
            for v in out.iter_mut() {
                *v *= factor;
            }
        }

        fn mul_vec(&self, x: &[f64], out: &mut [f64]) {
            self.inner.mul_vec(x, out);
        }

        fn mul_transpose_vec(&self, v: &[f64], out: &mut [f64]) {
            self.inner.mul_transpose_vec(v, out);
        }
    }

    fn orthogonal_columns() -> Vec<f64> {
        let x0 = [1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let x1 = [1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0];
        let x2 = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, -1.0, -1.0, -1.0, -1.0];
        x0.iter().chain(&x1).chain(&x2).copied().collect()
    }

    #[test]
    fn inconsistent_direction_is_fatal() {
        let values = orthogonal_columns();
        let y: Vec<f64> = (0..10)
            .map(|i| 3.0 * values[i] + 2.0 * values[10 + i] + values[20 + i])
            .collect();
        let matrix = DriftingColumns {
            inner: DenseFeatures::new(10, 3, values, Parallelism::None).unwrap(),
            fetches: Cell::new(0),
        };
        let mut s =
            LarsSolver::new(matrix, Response::new(y), SolverOptions::default(), Parallelism::None)
                .unwrap();
        assert_eq!(s.iteration().unwrap(), IterationStatus::Stepped);
        match s.iteration() {
            Err(SolverError::DirectionValidation {
                check: DirectionCheck::UnitNorm,
                value,
            }) => assert!((value - 2.0_f64.sqrt()).abs() <= 1e-9),
            other => panic!("unexpected iteration result: {other:?}"),
        }
    }

    #[test]
    fn removal_that_misses_zero_is_fatal() {
        // One active column with |x|^2 = 3 and a huge coefficient of the
        // wrong sign: the LASSO step is exact in theory, but rounding leaves
        // the coefficient 2^-17 away from zero.
        let values = vec![1.0, 1.0, 1.0, 0.0, 1.0, -1.0, 0.0, 0.0];
        let x = DenseFeatures::new(4, 2, values, Parallelism::None).unwrap();
        let y = vec![5e10, 5e10, 5e10, 0.0];
        let options = SolverOptions {
            algorithm: Algorithm::Lasso,
            ..SolverOptions::default()
        };
        let mut s = LarsSolver::new(x, Response::new(y), options, Parallelism::None).unwrap();
        let checkpoint = Checkpoint {
            iteration: 4,
            l1_norm: 5e10,
            rms_error: 0.0,
            objective: 0.0,
            nactive: 1,
            coefficients: vec![(0, -5e10)],
            exclude: None,
            mu: None,
        };
        assert_eq!(s.restart(&checkpoint).unwrap(), 3);
        match s.iteration() {
            Err(SolverError::LassoConsistency { index: 0, value }) => {
                assert!(value.abs() > 1e-8);
            }
            other => panic!("unexpected iteration result: {other:?}"),
        }
    }

    #[test]
    fn restart_rejects_excluded_coefficient() {
        let mut s = solver(SolverOptions::default());
        let mut checkpoint = s.checkpoint();
        checkpoint.coefficients = vec![(2, 0.5)];
        checkpoint.exclude = Some(vec![2]);
        match s.restart(&checkpoint) {
            Err(SolverError::Restart(err)) => {
                assert_eq!(err.kind, CheckpointErrorKind::ExcludedCoefficient { index: 2 });
            }
            other => panic!("unexpected restart result: {other:?}"),
        }
    }
}
