//! Preconditioned conjugate gradient for the active-set Gram system.
//!
//! ```text
//! r = b - G x;  z = M r;  p = z
//! loop:
//!     alpha = (r.z) / (p.Gp)
//!     x += alpha p;  r -= alpha Gp
//!     stop when ||r|| <= tol * ||b||
//!     z = M r;  beta = (r.z)_new / (r.z);  p = z + beta p
//! ```
//!
//! The residual is recomputed from scratch every `restart` iterations and the
//! search direction reset, which limits drift on ill-conditioned systems.

use crate::cholesky::CholeskyFactor;
use crate::gram::{dot, GramMatrix};

/// Approximate inverse of the Gram matrix used to accelerate conjugate gradient.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Preconditioner {
    /// Symmetric successive over-relaxation sweep with relaxation `omega` in (0, 2).
    Ssor { omega: f64 },
    /// Inverse of a Cholesky factorization of the Gram matrix, grown by a unit
    /// row when a single predictor is appended.
    #[default]
    CholeskyInverse,
}

/// Conjugate gradient did not reach the tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CgFailure {
    pub iterations: usize,
    pub residual: f64,
}

/// Preconditioner state carried between iterations.
#[derive(Debug, Clone)]
pub(crate) enum PreconditionerState {
    Ssor { omega: f64 },
    /// Dense row-major `n x n` approximate inverse.
    Dense { n: usize, values: Vec<f64> },
    Identity,
}

impl PreconditionerState {
    /// Build from scratch for `g`; `quiet` suppresses diagnostics on workers.
    pub(crate) fn compute(kind: Preconditioner, g: &GramMatrix, quiet: bool) -> Self {
        match kind {
            Preconditioner::Ssor { omega } => Self::Ssor { omega },
            Preconditioner::CholeskyInverse => match CholeskyFactor::factorize(g) {
                Ok(factor) => Self::Dense {
                    n: g.dim(),
                    values: factor.inverse(),
                },
                Err(err) => {
                    if quiet {
                        return Self::Identity;
                    }
                    log::debug!(
                        "Cholesky decomposition for preconditioning failed at pivot {} ({:.3e})",
                        err.pivot,
                        err.value
                    );
                    Self::Identity
                }
            },
        }
    }

    /// Extend a dense inverse by one trailing unit row/column.
    ///
    /// Returns false when there is no dense inverse of the previous size.
    pub(crate) fn grow(&mut self, new_dim: usize) -> bool {
        let Self::Dense { n, values } = self else {
            return false;
        };
        if *n + 1 != new_dim {
            return false;
        }
        let old = *n;
        let mut grown = vec![0.0; new_dim * new_dim];
        for i in 0..old {
            grown[i * new_dim..i * new_dim + old].copy_from_slice(&values[i * old..(i + 1) * old]);
        }
        grown[old * new_dim + old] = 1.0;
        *n = new_dim;
        *values = grown;
        true
    }

    /// `z = M r`.
    fn apply(&self, g: &GramMatrix, r: &[f64], z: &mut [f64]) {
        match self {
            Self::Identity => z.copy_from_slice(r),
            Self::Dense { n, values } => {
                for i in 0..*n {
                    z[i] = dot(&values[i * n..(i + 1) * n], r);
                }
            }
            Self::Ssor { omega } => ssor_sweep(g, *omega, r, z),
        }
    }
}

/// Apply the SSOR approximate inverse
/// `M^{-1} = w(2-w) (D + wU)^{-1} D (D + wL)^{-1}` to `r`.
fn ssor_sweep(g: &GramMatrix, omega: f64, r: &[f64], z: &mut [f64]) {
    let n = g.dim();
    // Forward: (D + wL) y = r
    for i in 0..n {
        let mut sum = r[i];
        for k in 0..i {
            sum -= omega * g.get(i, k) * z[k];
        }
        z[i] = sum / g.get(i, i);
    }
    // Scale by D.
    for i in 0..n {
        z[i] *= g.get(i, i);
    }
    // Backward: (D + wU) z = D y
    for i in (0..n).rev() {
        let mut sum = z[i];
        for k in i + 1..n {
            sum -= omega * g.get(i, k) * z[k];
        }
        z[i] = sum / g.get(i, i);
    }
    let factor = omega * (2.0 - omega);
    for v in z.iter_mut() {
        *v *= factor;
    }
}

/// Solve `G x = b` starting from the contents of `x`.
pub(crate) fn solve(
    g: &GramMatrix,
    b: &[f64],
    x: &mut [f64],
    preconditioner: &PreconditionerState,
    max_iters: usize,
    restart: usize,
    tol: f64,
) -> Result<usize, CgFailure> {
    let n = g.dim();
    let b_norm = dot(b, b).sqrt();
    if n == 0 || b_norm == 0.0 {
        x.fill(0.0);
        return Ok(0);
    }

    let mut r = vec![0.0; n];
    let mut z = vec![0.0; n];
    let mut p = vec![0.0; n];
    let mut gp = vec![0.0; n];
    let mut rz = 0.0;
    let mut r_norm = f64::INFINITY;

    for iter in 0..max_iters {
        if iter % restart.max(1) == 0 {
            g.mul_vec(x, &mut gp);
            for i in 0..n {
                r[i] = b[i] - gp[i];
            }
            r_norm = dot(&r, &r).sqrt();
            if r_norm <= tol * b_norm {
                return Ok(iter);
            }
            preconditioner.apply(g, &r, &mut z);
            p.copy_from_slice(&z);
            rz = dot(&r, &z);
        }

        g.mul_vec(&p, &mut gp);
        let pgp = dot(&p, &gp);
        if !(pgp > 0.0) || !rz.is_finite() {
            return Err(CgFailure {
                iterations: iter,
                residual: r_norm,
            });
        }
        let alpha = rz / pgp;
        for i in 0..n {
            x[i] += alpha * p[i];
            r[i] -= alpha * gp[i];
        }
        r_norm = dot(&r, &r).sqrt();
        if r_norm <= tol * b_norm {
            return Ok(iter + 1);
        }

        preconditioner.apply(g, &r, &mut z);
        let rz_new = dot(&r, &z);
        let beta = rz_new / rz;
        for i in 0..n {
            p[i] = z[i] + beta * p[i];
        }
        rz = rz_new;
    }

    Err(CgFailure {
        iterations: max_iters,
        residual: r_norm,
    })
}
