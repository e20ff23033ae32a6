use faer_core::mul::matmul;
use faer_core::{mat, Parallelism};

use crate::active::ActiveSetChange;
use crate::features::{dense_mul_transpose_vec, dense_mul_vec, DesignMatrix};

/// Sign-adjusted columns of the active predictors (`X_A`).
#[derive(Debug, Clone, Default)]
pub(crate) struct ActiveDesign {
    ndata: usize,
    signs: Vec<f64>,
    /// Column-major, `ndata x signs.len()`.
    columns: Vec<f64>,
}

impl ActiveDesign {
    pub(crate) fn new(ndata: usize) -> Self {
        Self {
            ndata,
            signs: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Recompute signs from the correlations and regenerate every column.
    pub(crate) fn rebuild<M: DesignMatrix>(
        &mut self,
        matrix: &M,
        active: &[usize],
        correlations: &[f64],
    ) {
        let n = active.len();
        self.signs.clear();
        self.signs.extend(
            active
                .iter()
                .map(|&j| if correlations[j] < 0.0 { -1.0 } else { 1.0 }),
        );
        self.columns.resize(self.ndata * n, 0.0);
        for (k, &j) in active.iter().enumerate() {
            let column = &mut self.columns[k * self.ndata..(k + 1) * self.ndata];
            matrix.column_into(j, column);
            if self.signs[k] < 0.0 {
                for v in column.iter_mut() {
                    *v = -*v;
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.signs.len()
    }

    pub(crate) fn signs(&self) -> &[f64] {
        &self.signs
    }

    pub(crate) fn column(&self, k: usize) -> &[f64] {
        &self.columns[k * self.ndata..(k + 1) * self.ndata]
    }

    /// `out = X_A * w`.
    pub(crate) fn mul_vec(&self, w: &[f64], out: &mut [f64], parallelism: Parallelism) {
        dense_mul_vec(&self.columns, self.ndata, self.len(), w, out, parallelism);
    }

    /// `out = X_A^T * v`.
    pub(crate) fn mul_transpose_vec(&self, v: &[f64], out: &mut [f64], parallelism: Parallelism) {
        dense_mul_transpose_vec(&self.columns, self.ndata, self.len(), v, out, parallelism);
    }

    fn inner(&self, j: usize, k: usize) -> f64 {
        dot(self.column(j), self.column(k))
    }
}

/// Symmetric Gram matrix of the active columns, `G_A = X_A^T X_A`.
///
/// Stored row-major. `valid` is false until the first build and after any
/// failed solve; a stale matrix is always rebuilt from scratch.
#[derive(Debug, Clone)]
pub(crate) struct GramMatrix {
    n: usize,
    data: Vec<f64>,
    valid: bool,
    parallelism: Parallelism,
}

impl Default for GramMatrix {
    fn default() -> Self {
        Self::new(Parallelism::None)
    }
}

impl GramMatrix {
    /// Empty matrix; full rebuilds run `X_A^T X_A` with `parallelism`.
    pub(crate) fn new(parallelism: Parallelism) -> Self {
        Self {
            n: 0,
            data: Vec::new(),
            valid: false,
            parallelism,
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.n
    }

    pub(crate) fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    pub(crate) fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    pub(crate) fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }

    /// `out = G_A * x`.
    pub(crate) fn mul_vec(&self, x: &[f64], out: &mut [f64]) {
        for (i, slot) in out.iter_mut().enumerate().take(self.n) {
            *slot = dot(self.row(i), x);
        }
    }

    /// Bring the matrix in line with `design` after `change`.
    ///
    /// Single-index events reuse the previous entries; anything else (or a
    /// stale matrix) triggers a full rebuild.
    pub(crate) fn update(&mut self, design: &ActiveDesign, change: ActiveSetChange) {
        let n = design.len();
        match change {
            ActiveSetChange::Added { position, .. } if self.valid && self.n + 1 == n => {
                self.insert(design, position);
            }
            ActiveSetChange::Removed { position, .. } if self.valid && self.n == n + 1 => {
                self.delete(position);
            }
            ActiveSetChange::Unchanged if self.valid && self.n == n => {}
            _ => self.rebuild(design),
        }
        self.symmetrize();
        self.valid = true;
    }

    /// Full `O(n^2 * ndata)` rebuild as `X_A^T X_A`.
    pub(crate) fn rebuild(&mut self, design: &ActiveDesign) {
        let n = design.len();
        self.n = n;
        self.data.clear();
        self.data.resize(n * n, 0.0);
        if n > 0 && design.ndata > 0 {
            let x_a = mat::from_column_major_slice::<f64>(&design.columns, design.ndata, n);
            let acc = mat::from_column_major_slice_mut::<f64>(&mut self.data, n, n);
            matmul(acc, x_a.transpose(), x_a, None, 1.0, self.parallelism);
        }
        // The product is symmetric only up to rounding.
        self.symmetrize();
        self.valid = true;
    }

    /// Grow by one row/column at `position`; only the new row is computed.
    fn insert(&mut self, design: &ActiveDesign, position: usize) {
        let old = self.n;
        let n = old + 1;
        let mut data = vec![0.0; n * n];
        let shift = |i: usize| if i >= position { i + 1 } else { i };
        for i in 0..old {
            for j in 0..=i {
                data[shift(i) * n + shift(j)] = self.data[i * old + j];
            }
        }
        for k in 0..n {
            let v = design.inner(position, k);
            let (i, j) = if k >= position { (k, position) } else { (position, k) };
            data[i * n + j] = v;
        }
        self.n = n;
        self.data = data;
    }

    /// Shrink by deleting row/column `position`.
    fn delete(&mut self, position: usize) {
        let old = self.n;
        let n = old - 1;
        let mut data = Vec::with_capacity(n * n);
        for i in (0..old).filter(|&i| i != position) {
            for j in (0..old).filter(|&j| j != position) {
                data.push(self.data[i * old + j]);
            }
        }
        self.n = n;
        self.data = data;
    }

    /// Mirror the lower triangle onto the upper one.
    fn symmetrize(&mut self) {
        let n = self.n;
        for i in 0..n {
            for j in i + 1..n {
                self.data[i * n + j] = self.data[j * n + i];
            }
        }
    }
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::features::DenseFeatures;

    pub(crate) fn features(nrows: usize, ncols: usize) -> DenseFeatures {
        let mut values = Vec::with_capacity(nrows * ncols);
        for j in 0..ncols {
            for i in 0..nrows {
                let freq = 0.61 + 0.37 * j as f64;
                let wobble = 0.1 * ((i * (j + 2)) as f64 * 0.23).cos();
                values.push(((i + 1) as f64 * freq).sin() + wobble);
            }
        }
        DenseFeatures::new(nrows, ncols, values, Parallelism::None).unwrap()
    }

    fn assert_symmetric(g: &GramMatrix) {
        for i in 0..g.dim() {
            for j in 0..g.dim() {
                assert!((g.get(i, j) - g.get(j, i)).abs() <= 1e-12);
            }
        }
    }

    fn assert_close(a: &GramMatrix, b: &GramMatrix) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
            assert!((x - y).abs() <= 1e-6, "{x} vs {y}");
        }
    }

    #[test]
    fn incremental_updates_match_rebuild() {
        let x = features(20, 6);
        let c = [0.3, -0.2, 0.5, -0.4, 0.1, 0.9];
        let mut design = ActiveDesign::new(20);
        let mut gram = GramMatrix::default();

        let sequence: [&[usize]; 6] = [
            &[2],
            &[2, 5],
            &[2, 5, 1],
            &[2, 4, 5, 1],
            &[2, 4, 1],
            &[4, 1],
        ];
        let mut last: &[usize] = &[];
        for active in sequence {
            design.rebuild(&x, active, &c);
            let change = ActiveSetChange::between(last, active);
            assert!(!matches!(change, ActiveSetChange::Rebuild));
            gram.update(&design, change);
            assert_symmetric(&gram);

            let mut full = GramMatrix::default();
            full.rebuild(&design);
            assert_close(&gram, &full);
            last = active;
        }
    }

    #[test]
    fn signs_follow_correlations() {
        let x = features(5, 3);
        let mut design = ActiveDesign::new(5);
        design.rebuild(&x, &[1, 0], &[2.0, -1.0, 0.0]);
        assert_eq!(design.signs(), &[-1.0, 1.0]);
        for (a, b) in design.column(0).iter().zip(x.column(1)) {
            assert_eq!(*a, -*b);
        }
    }

    #[test]
    fn rebuild_matches_pairwise_inner_products() {
        let x = features(12, 4);
        let mut design = ActiveDesign::new(12);
        design.rebuild(&x, &[3, 0, 2], &[0.5, 0.1, -0.3, -0.8]);
        let mut gram = GramMatrix::default();
        gram.rebuild(&design);
        assert_eq!(gram.dim(), 3);
        for j in 0..3 {
            for k in 0..3 {
                let expected = dot(design.column(j), design.column(k));
                assert!((gram.get(j, k) - expected).abs() <= 1e-12);
            }
        }
    }

    #[test]
    fn stale_matrix_is_rebuilt() {
        let x = features(8, 3);
        let c = [1.0, 1.0, 1.0];
        let mut design = ActiveDesign::new(8);
        let mut gram = GramMatrix::default();
        design.rebuild(&x, &[0, 1], &c);
        gram.rebuild(&design);
        gram.invalidate();

        design.rebuild(&x, &[0, 2], &c);
        gram.update(&design, ActiveSetChange::Unchanged);
        let mut full = GramMatrix::default();
        full.rebuild(&design);
        assert_close(&gram, &full);
    }
}
