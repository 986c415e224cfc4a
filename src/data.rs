//! Data
//!
//! The borrowed [`Matrix`] view accepted by the public API, and the helpers that
//! move data into owned `nalgebra` matrices for the numerical core.
use crate::errors::DmlError;
use nalgebra::{DMatrix, DVector};

/// Contiguous Column Major Matrix data container.
///
/// This structure holds a dense matrix of values in a single contiguous memory block
/// in column-major order (Fortran-style), which allows for efficient column slicing
/// and zero-copy hand-off from columnar sources.
///
/// # Type Parameters
/// * `T` - The numeric type of the data (e.g., `f32`, `f64`).
pub struct Matrix<'a, T> {
    /// The raw data stored in a single slice.
    pub data: &'a [T],
    /// Number of rows in the matrix.
    pub rows: usize,
    /// Number of columns in the matrix.
    pub cols: usize,
}

impl<'a, T> Matrix<'a, T> {
    /// Create a new Matrix.
    pub fn new(data: &'a [T], rows: usize, cols: usize) -> Self {
        Matrix { data, rows, cols }
    }

    /// Create a new Matrix, checking that the slice holds exactly `rows * cols` values.
    pub fn try_new(data: &'a [T], rows: usize, cols: usize) -> Result<Self, DmlError> {
        if data.len() != rows * cols {
            return Err(DmlError::Configuration(format!(
                "matrix of shape ({rows}, {cols}) needs {} values, {} provided",
                rows * cols,
                data.len()
            )));
        }
        Ok(Matrix { data, rows, cols })
    }
}

impl Matrix<'_, f64> {
    /// Copy the view into an owned `DMatrix`, validating its length and that
    /// every value is finite.
    ///
    /// * `name` - Name used in error messages (e.g. `"Y"`).
    pub fn to_dmatrix(&self, name: &str) -> Result<DMatrix<f64>, DmlError> {
        if self.data.len() != self.rows * self.cols {
            return Err(DmlError::Configuration(format!(
                "{name} has shape ({}, {}) but holds {} values",
                self.rows,
                self.cols,
                self.data.len()
            )));
        }
        if let Some(pos) = self.data.iter().position(|v| !v.is_finite()) {
            return Err(DmlError::Configuration(format!(
                "{name} contains a non-finite value at row {}, column {}",
                pos % self.rows.max(1),
                pos / self.rows.max(1)
            )));
        }
        Ok(DMatrix::from_column_slice(self.rows, self.cols, self.data))
    }
}

/// Horizontally stack matrices with equal row counts.
///
/// `rows` is needed because every block may have zero columns.
pub fn hstack(rows: usize, blocks: &[&DMatrix<f64>]) -> DMatrix<f64> {
    let cols: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut out = DMatrix::zeros(rows, cols);
    let mut offset = 0;
    for block in blocks {
        for j in 0..block.ncols() {
            out.set_column(offset + j, &block.column(j));
        }
        offset += block.ncols();
    }
    out
}

/// Gather rows of `m` in the order given by `index`.
pub fn take_rows(m: &DMatrix<f64>, index: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(index.len(), m.ncols(), |i, j| m[(index[i], j)])
}

/// Gather entries of an optional weight slice.
pub fn take_weights(sample_weight: Option<&[f64]>, index: &[usize]) -> Option<Vec<f64>> {
    sample_weight.map(|w| index.iter().map(|&i| w[i]).collect())
}

/// Weighted mean of each column.
pub fn weighted_column_means(m: &DMatrix<f64>, sample_weight: Option<&[f64]>) -> DVector<f64> {
    let n = m.nrows();
    match sample_weight {
        Some(w) => {
            let total: f64 = w.iter().sum();
            DVector::from_fn(m.ncols(), |j, _| {
                m.column(j).iter().zip(w).map(|(v, wi)| v * wi).sum::<f64>() / total
            })
        }
        None => DVector::from_fn(m.ncols(), |j, _| m.column(j).sum() / n as f64),
    }
}

/// Validate an optional sample weight vector against the row count.
pub fn validate_sample_weight(sample_weight: Option<&[f64]>, n: usize) -> Result<(), DmlError> {
    if let Some(w) = sample_weight {
        if w.len() != n {
            return Err(DmlError::Configuration(format!(
                "sample_weight has {} entries but the data has {n} rows",
                w.len()
            )));
        }
        if w.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(DmlError::Configuration(
                "sample_weight must be finite and non-negative".to_string(),
            ));
        }
        if w.iter().sum::<f64>() <= 0.0 {
            return Err(DmlError::Configuration("sample_weight must have a positive sum".to_string()));
        }
    }
    Ok(())
}
