use core::fmt;

use faer_core::mul::matmul;
use faer_core::{mat, Parallelism};

/// Per-column transform applied before fitting: `x_scaled = (x - shift) / scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnScaling {
    pub scale: f64,
    pub shift: f64,
}

impl Default for ColumnScaling {
    fn default() -> Self {
        Self {
            scale: 1.0,
            shift: 0.0,
        }
    }
}

/// Feature matrix collaborator used by the solver.
///
/// Implementations may partition rows across cooperating workers. Products
/// must return the fully combined result on every worker. The broadcast hooks
/// copy the coordinator's values to all workers; the defaults describe a
/// single process.
pub trait DesignMatrix {
    /// Number of observations (rows).
    fn nrows(&self) -> usize;
    /// Number of candidate predictors (columns).
    fn ncols(&self) -> usize;
    /// Scale and shift used to map coefficients back to physical units.
    fn column_scaling(&self, col: usize) -> ColumnScaling;
    /// Write column `col` into `out` (length `nrows`).
    fn column_into(&self, col: usize, out: &mut [f64]);
    /// `out = X * x`.
    fn mul_vec(&self, x: &[f64], out: &mut [f64]);
    /// `out = X^T * v`.
    fn mul_transpose_vec(&self, v: &[f64], out: &mut [f64]);

    /// Whether this worker owns externally visible side effects.
    fn is_coordinator(&self) -> bool {
        true
    }

    /// Replace `indices` with the coordinator's copy.
    fn broadcast_indices(&self, indices: &mut Vec<usize>) {
        let _ = indices;
    }

    /// Replace `values` with the coordinator's copy.
    fn broadcast_values(&self, values: &mut [f64]) {
        let _ = values;
    }
}

/// Validation errors for feature storage.
#[derive(Debug, Clone)]
pub enum FeatureError {
    /// Value buffer length does not match nrows * ncols.
    ValuesLen { expected: usize, actual: usize },
    /// Scale or shift vector length does not match ncols.
    ScalingLen { expected: usize, actual: usize },
    /// col_ptrs length is not ncols + 1.
    ColPtrLen { expected: usize, actual: usize },
    /// col_ptrs[0] is not 0.
    ColPtrStart { value: usize },
    /// col_ptrs is not non-decreasing.
    ColPtrNotMonotonic { col: usize, prev: usize, next: usize },
    /// col_ptrs[ncols] does not match row_indices length.
    ColPtrOutOfBounds { last: usize, row_indices_len: usize },
    /// values and row_indices lengths differ.
    SparseValuesLen { expected: usize, actual: usize },
    /// A row index is >= nrows.
    RowIndexOutOfBounds { col: usize, row: usize, nrows: usize },
    /// Row indices in a column are not strictly increasing.
    RowIndexNotSorted { col: usize, prev: usize, next: usize },
}

impl fmt::Display for FeatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValuesLen { expected, actual } => {
                write!(f, "values length {actual} does not match expected {expected}")
            }
            Self::ScalingLen { expected, actual } => {
                write!(f, "scaling length {actual} does not match column count {expected}")
            }
            Self::ColPtrLen { expected, actual } => {
                write!(f, "col_ptrs length {actual} does not match expected {expected}")
            }
            Self::ColPtrStart { value } => {
                write!(f, "col_ptrs must start at 0 (got {value})")
            }
            Self::ColPtrNotMonotonic { col, prev, next } => {
                write!(f, "col_ptrs not monotonic at col {col}: {prev} > {next}")
            }
            Self::ColPtrOutOfBounds {
                last,
                row_indices_len,
            } => {
                write!(
                    f,
                    "col_ptrs end {last} does not match row_indices length {row_indices_len}"
                )
            }
            Self::SparseValuesLen { expected, actual } => {
                write!(f, "sparse values length {actual} does not match expected {expected}")
            }
            Self::RowIndexOutOfBounds { col, row, nrows } => {
                write!(f, "row index {row} in col {col} exceeds nrows {nrows}")
            }
            Self::RowIndexNotSorted { col, prev, next } => {
                write!(f, "row indices not sorted in col {col}: {prev} >= {next}")
            }
        }
    }
}

impl std::error::Error for FeatureError {}

/// Dense column-major feature matrix.
#[derive(Debug, Clone)]
pub struct DenseFeatures {
    nrows: usize,
    ncols: usize,
    values: Vec<f64>,
    scaling: Vec<ColumnScaling>,
    parallelism: Parallelism,
}

impl DenseFeatures {
    /// Wrap column-major `values` (`nrows * ncols` entries).
    pub fn new(
        nrows: usize,
        ncols: usize,
        values: Vec<f64>,
        parallelism: Parallelism,
    ) -> Result<Self, FeatureError> {
        let expected = nrows * ncols;
        if values.len() != expected {
            return Err(FeatureError::ValuesLen {
                expected,
                actual: values.len(),
            });
        }
        Ok(Self {
            nrows,
            ncols,
            values,
            scaling: vec![ColumnScaling::default(); ncols],
            parallelism,
        })
    }

    /// Build from row slices; every row must have the same length.
    pub fn from_rows(rows: &[Vec<f64>], parallelism: Parallelism) -> Result<Self, FeatureError> {
        let nrows = rows.len();
        let ncols = rows.first().map_or(0, Vec::len);
        let mut values = vec![0.0; nrows * ncols];
        for (i, row) in rows.iter().enumerate() {
            if row.len() != ncols {
                return Err(FeatureError::ValuesLen {
                    expected: nrows * ncols,
                    actual: nrows * row.len(),
                });
            }
            for (j, &v) in row.iter().enumerate() {
                values[j * nrows + i] = v;
            }
        }
        Self::new(nrows, ncols, values, parallelism)
    }

    /// Attach scaling recorded by an external pre-processing step.
    pub fn with_scaling(mut self, scaling: Vec<ColumnScaling>) -> Result<Self, FeatureError> {
        if scaling.len() != self.ncols {
            return Err(FeatureError::ScalingLen {
                expected: self.ncols,
                actual: scaling.len(),
            });
        }
        self.scaling = scaling;
        Ok(self)
    }

    /// Center each column and scale it to unit Euclidean norm.
    ///
    /// Columns with zero spread keep scale 1.
    pub fn normalize(&mut self) {
        let n = self.nrows as f64;
        for col in 0..self.ncols {
            let column = &mut self.values[col * self.nrows..(col + 1) * self.nrows];
            let shift = if self.nrows > 0 {
                column.iter().sum::<f64>() / n
            } else {
                0.0
            };
            for v in column.iter_mut() {
                *v -= shift;
            }
            let norm = column.iter().map(|v| v * v).sum::<f64>().sqrt();
            let scale = if norm > 0.0 { norm } else { 1.0 };
            for v in column.iter_mut() {
                *v /= scale;
            }
            self.scaling[col] = ColumnScaling { scale, shift };
        }
    }

    /// Column-major value buffer.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Values of a single column.
    pub fn column(&self, col: usize) -> &[f64] {
        &self.values[col * self.nrows..(col + 1) * self.nrows]
    }
}

impl DesignMatrix for DenseFeatures {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    fn column_scaling(&self, col: usize) -> ColumnScaling {
        self.scaling[col]
    }

    fn column_into(&self, col: usize, out: &mut [f64]) {
        out.copy_from_slice(self.column(col));
    }

    fn mul_vec(&self, x: &[f64], out: &mut [f64]) {
        dense_mul_vec(&self.values, self.nrows, self.ncols, x, out, self.parallelism);
    }

    fn mul_transpose_vec(&self, v: &[f64], out: &mut [f64]) {
        dense_mul_transpose_vec(&self.values, self.nrows, self.ncols, v, out, self.parallelism);
    }
}

/// `out = A * x` for column-major `A`.
pub(crate) fn dense_mul_vec(
    values: &[f64],
    nrows: usize,
    ncols: usize,
    x: &[f64],
    out: &mut [f64],
    parallelism: Parallelism,
) {
    if ncols == 0 {
        out.fill(0.0);
        return;
    }
    let a = mat::from_column_major_slice::<f64>(values, nrows, ncols);
    let rhs = mat::from_column_major_slice::<f64>(x, ncols, 1);
    let acc = mat::from_column_major_slice_mut::<f64>(out, nrows, 1);
    matmul(acc, a, rhs, None, 1.0, parallelism);
}

/// `out = A^T * v` for column-major `A`.
pub(crate) fn dense_mul_transpose_vec(
    values: &[f64],
    nrows: usize,
    ncols: usize,
    v: &[f64],
    out: &mut [f64],
    parallelism: Parallelism,
) {
    if nrows == 0 {
        out.fill(0.0);
        return;
    }
    let a = mat::from_column_major_slice::<f64>(values, nrows, ncols);
    let rhs = mat::from_column_major_slice::<f64>(v, nrows, 1);
    let acc = mat::from_column_major_slice_mut::<f64>(out, ncols, 1);
    matmul(acc, a.transpose(), rhs, None, 1.0, parallelism);
}

/// Observation vector with the global shift removed before fitting.
#[derive(Debug, Clone)]
pub struct Response {
    values: Vec<f64>,
    shift: f64,
}

impl Response {
    /// Use `values` as-is with zero shift.
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, shift: 0.0 }
    }

    /// Values that were already shifted by `shift`.
    pub fn with_shift(values: Vec<f64>, shift: f64) -> Self {
        Self { values, shift }
    }

    /// Subtract the mean and record it as the shift.
    pub fn centered(mut values: Vec<f64>) -> Self {
        let shift = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        for v in &mut values {
            *v -= shift;
        }
        Self { values, shift }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn shift(&self) -> f64 {
        self.shift
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DenseFeatures {
        DenseFeatures::from_rows(
            &[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]],
            Parallelism::None,
        )
        .unwrap()
    }

    #[test]
    fn products_match_manual_loops() {
        let x = sample();
        let mut out = vec![0.0; 3];
        x.mul_vec(&[1.0, -1.0], &mut out);
        assert_eq!(out, vec![-1.0, -1.0, -1.0]);

        let mut out = vec![0.0; 2];
        x.mul_transpose_vec(&[1.0, 0.0, 2.0], &mut out);
        assert_eq!(out, vec![11.0, 14.0]);
    }

    #[test]
    fn normalize_records_shift_and_scale() {
        let mut x = sample();
        x.normalize();
        let s = x.column_scaling(0);
        assert!((s.shift - 3.0).abs() <= 1e-12);
        assert!((s.scale - 8.0_f64.sqrt()).abs() <= 1e-12);
        let norm: f64 = x.column(1).iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() <= 1e-12);
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = DenseFeatures::from_rows(&[vec![1.0, 2.0], vec![3.0]], Parallelism::None);
        assert!(matches!(err, Err(FeatureError::ValuesLen { .. })));
    }

    #[test]
    fn centered_response_records_mean() {
        let y = Response::centered(vec![1.0, 2.0, 6.0]);
        assert!((y.shift() - 3.0).abs() <= 1e-12);
        assert!(y.values().iter().sum::<f64>().abs() <= 1e-12);
    }
}
