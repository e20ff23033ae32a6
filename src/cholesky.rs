//! Dense lower-triangular Cholesky factor with single row/column updates.
//!
//! Adding a row solves one triangular system for the new row of `L`.
//! Removing row/column `p` drops it from `L` and restores the trailing block
//! with a rank-1 update (LINPACK `dchud` style Givens recurrence).

use crate::gram::GramMatrix;

/// Pivots at or below this fraction of the original diagonal count as zero.
const PIVOT_TOL: f64 = 1e-12;

/// The factorization broke down at `pivot` (matrix not positive definite).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct NotPositiveDefinite {
    pub pivot: usize,
    pub value: f64,
}

/// `G = L * L^T` with `L` stored row-major, upper triangle zero.
#[derive(Debug, Clone, Default)]
pub(crate) struct CholeskyFactor {
    n: usize,
    l: Vec<f64>,
}

impl CholeskyFactor {
    pub(crate) fn dim(&self) -> usize {
        self.n
    }

    pub(crate) fn get(&self, i: usize, j: usize) -> f64 {
        self.l[i * self.n + j]
    }

    /// Full decomposition of `g`.
    pub(crate) fn factorize(g: &GramMatrix) -> Result<Self, NotPositiveDefinite> {
        let n = g.dim();
        let mut l = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = g.get(i, j);
                for k in 0..j {
                    sum -= l[i * n + k] * l[j * n + k];
                }
                if i == j {
                    if !(sum > PIVOT_TOL * g.get(i, i)) || !sum.is_finite() {
                        return Err(NotPositiveDefinite {
                            pivot: i,
                            value: sum,
                        });
                    }
                    l[i * n + i] = sum.sqrt();
                } else {
                    l[i * n + j] = sum / l[j * n + j];
                }
            }
        }
        Ok(Self { n, l })
    }

    /// Append a last row/column whose Gram entries are `row` (length `n + 1`).
    pub(crate) fn add_row(&mut self, row: &[f64]) -> Result<(), NotPositiveDefinite> {
        let old = self.n;
        let n = old + 1;
        debug_assert_eq!(row.len(), n);

        // Solve L z = row[..old] for the off-diagonal part of the new row.
        let mut z = vec![0.0; old];
        for i in 0..old {
            let mut sum = row[i];
            for k in 0..i {
                sum -= self.l[i * old + k] * z[k];
            }
            z[i] = sum / self.l[i * old + i];
        }
        let d = row[old] - z.iter().map(|v| v * v).sum::<f64>();
        if !(d > PIVOT_TOL * row[old]) || !d.is_finite() {
            return Err(NotPositiveDefinite { pivot: old, value: d });
        }

        let mut l = vec![0.0; n * n];
        for i in 0..old {
            l[i * n..i * n + i + 1].copy_from_slice(&self.l[i * old..i * old + i + 1]);
        }
        l[old * n..old * n + old].copy_from_slice(&z);
        l[old * n + old] = d.sqrt();
        self.n = n;
        self.l = l;
        Ok(())
    }

    /// Remove row/column `position` of the factored matrix.
    ///
    /// On failure the factor is left unchanged.
    pub(crate) fn remove_row(&mut self, position: usize) -> Result<(), NotPositiveDefinite> {
        let old = self.n;
        let n = old - 1;
        let mut l = vec![0.0; n * n];
        for i in 0..position {
            l[i * n..i * n + i + 1].copy_from_slice(&self.l[i * old..i * old + i + 1]);
        }
        for i in position + 1..old {
            let r = i - 1;
            l[r * n..r * n + position].copy_from_slice(&self.l[i * old..i * old + position]);
            for j in position + 1..=i {
                l[r * n + j - 1] = self.l[i * old + j];
            }
        }

        // The removed column feeds a rank-1 update of the trailing block.
        let mut v: Vec<f64> = (position + 1..old).map(|i| self.l[i * old + position]).collect();
        for j in position..n {
            let ljj = l[j * n + j];
            let vj = v[j - position];
            let arg = ljj * ljj + vj * vj;
            if !(arg > 0.0) || !arg.is_finite() || ljj == 0.0 {
                return Err(NotPositiveDefinite {
                    pivot: j,
                    value: arg,
                });
            }
            let r = arg.sqrt();
            let c = r / ljj;
            let s = vj / ljj;
            l[j * n + j] = r;
            for i in j + 1..n {
                let lij = (l[i * n + j] + s * v[i - position]) / c;
                l[i * n + j] = lij;
                v[i - position] = c * v[i - position] - s * lij;
            }
        }

        self.n = n;
        self.l = l;
        Ok(())
    }

    /// Solve `L L^T x = b`.
    pub(crate) fn solve(&self, b: &[f64], x: &mut [f64]) {
        let n = self.n;
        for i in 0..n {
            let mut sum = b[i];
            for k in 0..i {
                sum -= self.l[i * n + k] * x[k];
            }
            x[i] = sum / self.l[i * n + i];
        }
        for i in (0..n).rev() {
            let mut sum = x[i];
            for k in i + 1..n {
                sum -= self.l[k * n + i] * x[k];
            }
            x[i] = sum / self.l[i * n + i];
        }
    }

    /// Dense row-major `(L L^T)^{-1}`.
    pub(crate) fn inverse(&self) -> Vec<f64> {
        let n = self.n;
        let mut inv = vec![0.0; n * n];
        let mut e = vec![0.0; n];
        let mut col = vec![0.0; n];
        for j in 0..n {
            e.fill(0.0);
            e[j] = 1.0;
            self.solve(&e, &mut col);
            for i in 0..n {
                inv[i * n + j] = col[i];
            }
        }
        inv
    }
}
