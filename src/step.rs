use crate::active::{ActiveSet, ExcludeSet, PendingChange};

/// Stand-in for an unbounded step.
pub(crate) const HUGE_STEP: f64 = 1e20;
/// LASSO crossing points closer than this are ignored.
const LASSO_MIN_STEP: f64 = 1e-12;
/// A removed coefficient must land this close to zero.
const LASSO_ZERO_TOL: f64 = 1e-8;
const MIN_DIRECTION: f64 = 1e-40;

/// Step lengths along the equiangular direction and the events that bound them.
#[derive(Debug, Clone)]
pub(crate) struct StepState {
    /// LARS step to the next equalization point.
    pub gamma: f64,
    /// Step at which an active coefficient crosses zero.
    pub gamma_lasso: f64,
    /// Step actually taken.
    pub gamma_use: f64,
    /// Feature that joins at `gamma`.
    pub add_prop: Option<usize>,
    /// Active-set position of the coefficient that crosses zero at `gamma_lasso`.
    pub remove_prop: Option<usize>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            gamma: 0.0,
            gamma_lasso: HUGE_STEP,
            gamma_use: 0.0,
            add_prop: None,
            remove_prop: None,
        }
    }
}

/// Outcome of a coefficient update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BetaStep {
    pub gamma_use: f64,
    /// Feature forced to zero by the LASSO bound.
    pub removed: Option<usize>,
}

/// The coefficient scheduled for removal did not reach zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LassoViolation {
    pub index: usize,
    pub value: f64,
}

impl StepState {
    /// True when the LASSO bound is shorter than the LARS step.
    pub(crate) fn lasso_limited(&self, do_lasso: bool) -> bool {
        do_lasso && self.remove_prop.is_some() && self.gamma > self.gamma_lasso
    }

    /// Consume the active-set event scheduled by the last step.
    pub(crate) fn take_pending(&mut self, do_lasso: bool) -> PendingChange {
        let pending = match (self.lasso_limited(do_lasso), self.remove_prop, self.add_prop) {
            (true, Some(position), _) => {
                self.gamma_lasso = HUGE_STEP;
                PendingChange::Remove(position)
            }
            (_, _, Some(index)) => PendingChange::Add(index),
            _ => PendingChange::Search,
        };
        self.add_prop = None;
        self.remove_prop = None;
        pending
    }

    /// Forget scheduled events after a failed iteration or restart.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// LARS step length.
    ///
    /// For each inactive, non-excluded feature the candidates are
    /// `(C - c_j) / (A_A - a_j)` and `(C + c_j) / (A_A + a_j)`; the smallest
    /// positive one wins and names the joining feature. Without a candidate the
    /// step runs to the least-squares point, `C / A_A`.
    pub(crate) fn update_step_gamma(
        &mut self,
        correlations: &[f64],
        c_max: f64,
        a: &[f64],
        a_a: f64,
        active: &ActiveSet,
        exclude: &ExcludeSet,
    ) {
        self.gamma = HUGE_STEP;
        self.add_prop = None;
        self.remove_prop = None;

        for (j, (&c_j, &a_j)) in correlations.iter().zip(a).enumerate() {
            if exclude.contains(j) || active.contains(j) {
                continue;
            }
            let c1 = (c_max - c_j) / (a_a - a_j);
            let c2 = (c_max + c_j) / (a_a + a_j);
            if c1 > 0.0 && c1 < self.gamma {
                self.gamma = c1;
                self.add_prop = Some(j);
            }
            if c2 > 0.0 && c2 < self.gamma {
                self.gamma = c2;
                self.add_prop = Some(j);
            }
        }
        if self.add_prop.is_none() {
            self.gamma = c_max / a_a;
        }
    }

    /// Shortest positive step at which an active coefficient reaches zero.
    pub(crate) fn update_lasso_gamma(
        &mut self,
        beta: &[f64],
        active: &[usize],
        signs: &[f64],
        w_a: &[f64],
    ) {
        self.gamma_lasso = HUGE_STEP;
        self.remove_prop = None;
        for (i, (&j, (&sign, &w))) in active.iter().zip(signs.iter().zip(w_a)).enumerate() {
            if w.abs() <= MIN_DIRECTION {
                continue;
            }
            let gamma_i = -beta[j] / (sign * w);
            if gamma_i > LASSO_MIN_STEP && gamma_i < self.gamma_lasso {
                self.gamma_lasso = gamma_i;
                self.remove_prop = Some(i);
            }
        }
    }

    /// Advance the active coefficients by the chosen step.
    ///
    /// `beta[A_j] += w_A[j] * sign_j * gamma_use`; when the LASSO bound is
    /// active the crossing coefficient is pinned to exactly zero.
    pub(crate) fn update_beta(
        &mut self,
        beta: &mut [f64],
        do_lasso: bool,
        active: &[usize],
        signs: &[f64],
        w_a: &[f64],
    ) -> Result<BetaStep, LassoViolation> {
        let limited = self.lasso_limited(do_lasso);
        self.gamma_use = if limited { self.gamma_lasso } else { self.gamma };
        for ((&j, &sign), &w) in active.iter().zip(signs).zip(w_a) {
            beta[j] += w * sign * self.gamma_use;
        }

        let removed = match (limited, self.remove_prop) {
            (true, Some(position)) => {
                let index = active[position];
                let value = beta[index];
                if value.abs() > LASSO_ZERO_TOL {
                    return Err(LassoViolation { index, value });
                }
                beta[index] = 0.0;
                Some(index)
            }
            _ => None,
        };
        Ok(BetaStep {
            gamma_use: self.gamma_use,
            removed,
        })
    }
}
