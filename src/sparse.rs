use core::ops::Range;

use crate::features::{ColumnScaling, DesignMatrix, FeatureError};

/// Feature matrix in compressed sparse column (CSC) form.
///
/// Indices are zero-based; each column's row indices must be strictly
/// increasing. Products are computed column by column.
#[derive(Debug, Clone)]
pub struct SparseFeatures {
    nrows: usize,
    ncols: usize,
    col_ptrs: Vec<usize>,
    row_indices: Vec<usize>,
    values: Vec<f64>,
    scaling: Vec<ColumnScaling>,
}

impl SparseFeatures {
    /// Creates validated CSC feature storage.
    ///
    /// Requirements:
    /// - `col_ptrs.len() == ncols + 1`
    /// - `col_ptrs` is non-decreasing and starts at `0`
    /// - `col_ptrs[ncols] == row_indices.len() == values.len()`
    /// - row indices are sorted and `< nrows` within each column
    pub fn new(
        nrows: usize,
        ncols: usize,
        col_ptrs: Vec<usize>,
        row_indices: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self, FeatureError> {
        let expected = ncols + 1;
        if col_ptrs.len() != expected {
            return Err(FeatureError::ColPtrLen {
                expected,
                actual: col_ptrs.len(),
            });
        }
        if col_ptrs[0] != 0 {
            return Err(FeatureError::ColPtrStart { value: col_ptrs[0] });
        }
        for col in 0..ncols {
            let prev = col_ptrs[col];
            let next = col_ptrs[col + 1];
            if prev > next {
                return Err(FeatureError::ColPtrNotMonotonic { col, prev, next });
            }
        }
        let last = col_ptrs[ncols];
        if last != row_indices.len() {
            return Err(FeatureError::ColPtrOutOfBounds {
                last,
                row_indices_len: row_indices.len(),
            });
        }
        if values.len() != row_indices.len() {
            return Err(FeatureError::SparseValuesLen {
                expected: row_indices.len(),
                actual: values.len(),
            });
        }

        for col in 0..ncols {
            let rows = &row_indices[col_ptrs[col]..col_ptrs[col + 1]];
            let Some(&first) = rows.first() else {
                continue;
            };
            if first >= nrows {
                return Err(FeatureError::RowIndexOutOfBounds {
                    col,
                    row: first,
                    nrows,
                });
            }
            for pair in rows.windows(2) {
                let (prev, row) = (pair[0], pair[1]);
                if prev >= row {
                    return Err(FeatureError::RowIndexNotSorted { col, prev, next: row });
                }
                if row >= nrows {
                    return Err(FeatureError::RowIndexOutOfBounds { col, row, nrows });
                }
            }
        }

        Ok(Self {
            nrows,
            ncols,
            col_ptrs,
            row_indices,
            values,
            scaling: vec![ColumnScaling::default(); ncols],
        })
    }

    /// Build from `(row, col, value)` triplets; duplicates are summed.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        entries: &[(usize, usize, f64)],
    ) -> Result<Self, FeatureError> {
        let mut cols: Vec<Vec<(usize, f64)>> = vec![Vec::new(); ncols];
        for &(row, col, value) in entries {
            if col >= ncols {
                return Err(FeatureError::ColPtrLen {
                    expected: ncols + 1,
                    actual: col + 2,
                });
            }
            cols[col].push((row, value));
        }
        let mut col_ptrs = Vec::with_capacity(ncols + 1);
        let mut row_indices = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());
        col_ptrs.push(0);
        for mut col in cols {
            col.sort_unstable_by_key(|&(row, _)| row);
            for (row, value) in col {
                if row_indices.len() > *col_ptrs.last().unwrap_or(&0)
                    && row_indices.last() == Some(&row)
                {
                    if let Some(last) = values.last_mut() {
                        *last += value;
                    }
                    continue;
                }
                row_indices.push(row);
                values.push(value);
            }
            col_ptrs.push(row_indices.len());
        }
        Self::new(nrows, ncols, col_ptrs, row_indices, values)
    }

    /// Scale every column to unit Euclidean norm.
    ///
    /// Columns are not centered so that the sparsity pattern survives.
    pub fn normalize(&mut self) {
        for col in 0..self.ncols {
            let range = self.col_range(col);
            let norm = self.values[range.clone()]
                .iter()
                .map(|v| v * v)
                .sum::<f64>()
                .sqrt();
            let scale = if norm > 0.0 { norm } else { 1.0 };
            for v in &mut self.values[range] {
                *v /= scale;
            }
            self.scaling[col] = ColumnScaling { scale, shift: 0.0 };
        }
    }

    /// Number of stored non-zeros.
    pub fn nnz(&self) -> usize {
        self.row_indices.len()
    }

    /// Index range in row_indices for the given column.
    pub fn col_range(&self, col: usize) -> Range<usize> {
        self.col_ptrs[col]..self.col_ptrs[col + 1]
    }

    /// Sorted row indices for the given column.
    pub fn row_indices_of_col(&self, col: usize) -> &[usize] {
        &self.row_indices[self.col_range(col)]
    }

    /// Values for the given column, aligned with row_indices_of_col.
    pub fn values_of_col(&self, col: usize) -> &[f64] {
        &self.values[self.col_range(col)]
    }
}

impl DesignMatrix for SparseFeatures {
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
        out.fill(0.0);
        for (&row, &v) in self
            .row_indices_of_col(col)
            .iter()
            .zip(self.values_of_col(col))
        {
            out[row] = v;
        }
    }

    fn mul_vec(&self, x: &[f64], out: &mut [f64]) {
        out.fill(0.0);
        for (col, &xc) in x.iter().enumerate().take(self.ncols) {
            if xc == 0.0 {
                continue;
            }
            for idx in self.col_range(col) {
                out[self.row_indices[idx]] += self.values[idx] * xc;
            }
        }
    }

    fn mul_transpose_vec(&self, v: &[f64], out: &mut [f64]) {
        for (col, slot) in out.iter_mut().enumerate().take(self.ncols) {
            let mut sum = 0.0;
            for idx in self.col_range(col) {
                sum += self.values[idx] * v[self.row_indices[idx]];
            }
            *slot = sum;
        }
    }
}
