//! Final Stage
//!
//! The orthogonal regression of outcome residuals on the Kronecker product of
//! treatment residuals and the feature basis:
//!
//! $$\tilde{Y}_i \approx B \, (\tilde{T}_i \otimes \Phi(X_i))$$
//!
//! where $B$ is a $d_y \times (d_t d_\phi)$ matrix. Column `j * d_phi + k` of
//! the design holds `T_res[i, j] * Phi[i, k]`, so the coefficient of treatment
//! `j` on feature `k` for outcome `i` sits at `B[(i, j * d_phi + k)]`.
use crate::config::JsonIO;
use crate::errors::DmlError;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

pub mod elastic_net;
pub mod nuclear;
pub mod ols;
pub mod regression;

pub use regression::{CovType, FinalRegression, Regularizer};

/// Dimensions of the final-stage problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignShape {
    pub d_y: usize,
    pub d_t: usize,
    pub d_phi: usize,
}

impl DesignShape {
    pub fn new(d_y: usize, d_t: usize, d_phi: usize) -> Self {
        DesignShape { d_y, d_t, d_phi }
    }

    /// Number of design columns, `d_t * d_phi`.
    pub fn n_columns(&self) -> usize {
        self.d_t * self.d_phi
    }

    /// Design column of treatment `j` and feature `k`.
    pub fn column(&self, j: usize, k: usize) -> usize {
        j * self.d_phi + k
    }
}

/// Build the row-wise Kronecker product `T_res[i] ⊗ Phi[i]`.
pub fn cross_product_design(t_res: &DMatrix<f64>, phi: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError> {
    if t_res.nrows() != phi.nrows() {
        return Err(DmlError::Configuration(format!(
            "treatment residuals have {} rows but the feature basis has {}",
            t_res.nrows(),
            phi.nrows()
        )));
    }
    let d_phi = phi.ncols();
    Ok(DMatrix::from_fn(t_res.nrows(), t_res.ncols() * d_phi, |i, c| {
        t_res[(i, c / d_phi)] * phi[(i, c % d_phi)]
    }))
}

/// A regression of a multi-column target on the cross-product design.
///
/// Implementations must be `Clone` to take part in bootstrap inference, where
/// a fresh copy is refitted on every resample.
pub trait FinalModel: Send + Sync {
    fn fit(
        &mut self,
        design: &DMatrix<f64>,
        target: &DMatrix<f64>,
        shape: DesignShape,
        sample_weight: Option<&[f64]>,
    ) -> Result<(), DmlError>;

    /// Fitted coefficients, `d_y × (d_t d_phi)`.
    fn coefficients(&self) -> Option<&DMatrix<f64>>;

    /// Fitted values, one row per design row and one column per outcome.
    fn predict(&self, design: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        let coef = self.coefficients().ok_or(DmlError::NotFitted)?;
        if design.ncols() != coef.ncols() {
            return Err(DmlError::Configuration(format!(
                "final model was fitted on {} design columns, {} provided",
                coef.ncols(),
                design.ncols()
            )));
        }
        Ok(design * coef.transpose())
    }

    /// Parameter covariance, one `p × p` matrix per outcome column, when the
    /// model can provide one.
    fn covariance(&self) -> Option<&[DMatrix<f64>]> {
        None
    }

    /// Non-fatal warnings from the last fit.
    fn diagnostics(&self) -> Vec<String> {
        Vec::new()
    }
}

/// The fitted effect coefficients with shape `(d_y, d_t, d_phi)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientTensor {
    pub d_y: usize,
    pub d_t: usize,
    pub d_phi: usize,
    /// Row-major over `(i, j, k)`.
    values: Vec<f64>,
}

impl CoefficientTensor {
    /// Reshape a `d_y × (d_t d_phi)` coefficient matrix.
    pub fn from_matrix(coef: &DMatrix<f64>, shape: DesignShape) -> Result<Self, DmlError> {
        if coef.shape() != (shape.d_y, shape.n_columns()) {
            return Err(DmlError::Configuration(format!(
                "coefficient matrix of shape {:?} does not match ({}, {} x {})",
                coef.shape(),
                shape.d_y,
                shape.d_t,
                shape.d_phi
            )));
        }
        let mut values = Vec::with_capacity(coef.len());
        for i in 0..shape.d_y {
            for c in 0..shape.n_columns() {
                values.push(coef[(i, c)]);
            }
        }
        Ok(CoefficientTensor {
            d_y: shape.d_y,
            d_t: shape.d_t,
            d_phi: shape.d_phi,
            values,
        })
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.d_y, self.d_t, self.d_phi)
    }

    pub fn get(&self, i: usize, j: usize, k: usize) -> f64 {
        self.values[(i * self.d_t + j) * self.d_phi + k]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// The `d_y × (d_t d_phi)` matrix form.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.d_y, self.d_t * self.d_phi, &self.values)
    }

    /// The `d_y × d_t` slice of feature `k`.
    pub fn slice_matrix(&self, k: usize) -> DMatrix<f64> {
        DMatrix::from_fn(self.d_y, self.d_t, |i, j| self.get(i, j, k))
    }

    /// Singular values of the slice of feature `k`, in descending order.
    pub fn singular_values(&self, k: usize) -> Vec<f64> {
        let mut s: Vec<f64> = self.slice_matrix(k).singular_values().iter().copied().collect();
        s.sort_by(|a, b| b.total_cmp(a));
        s
    }
}

impl JsonIO for CoefficientTensor {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_product_layout() {
        let t = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let phi = DMatrix::from_row_slice(2, 3, &[1.0, 10.0, 100.0, 1.0, -1.0, 0.5]);
        let z = cross_product_design(&t, &phi).unwrap();
        assert_eq!(z.shape(), (2, 6));
        assert_eq!(z.row(0).iter().copied().collect::<Vec<f64>>(), vec![1.0, 10.0, 100.0, 2.0, 20.0, 200.0]);
        assert_eq!(z.row(1).iter().copied().collect::<Vec<f64>>(), vec![3.0, -3.0, 1.5, 4.0, -4.0, 2.0]);
        let shape = DesignShape::new(1, 2, 3);
        assert_eq!(z[(1, shape.column(1, 2))], 4.0 * 0.5);
    }

    #[test]
    fn test_cross_product_row_mismatch() {
        let t = DMatrix::zeros(2, 1);
        let phi = DMatrix::zeros(3, 1);
        assert!(cross_product_design(&t, &phi).is_err());
    }

    #[test]
    fn test_tensor_indexing_and_slices() {
        // d_y = 2, d_t = 2, d_phi = 2
        let coef = DMatrix::from_row_slice(2, 4, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let shape = DesignShape::new(2, 2, 2);
        let tensor = CoefficientTensor::from_matrix(&coef, shape).unwrap();
        assert_eq!(tensor.shape(), (2, 2, 2));
        assert_eq!(tensor.get(0, 1, 0), 3.0);
        assert_eq!(tensor.get(1, 0, 1), 6.0);
        assert_eq!(tensor.slice_matrix(1), DMatrix::from_row_slice(2, 2, &[2.0, 4.0, 6.0, 8.0]));
        assert_eq!(tensor.to_matrix(), coef);
        assert!(CoefficientTensor::from_matrix(&coef, DesignShape::new(2, 1, 2)).is_err());
    }

    #[test]
    fn test_tensor_singular_values() {
        let coef = DMatrix::from_row_slice(2, 2, &[0.0, 2.0, -3.0, 0.0]);
        let tensor = CoefficientTensor::from_matrix(&coef, DesignShape::new(2, 2, 1)).unwrap();
        let s = tensor.singular_values(0);
        assert!((s[0] - 3.0).abs() < 1e-12);
        assert!((s[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_tensor_json() {
        let coef = DMatrix::from_row_slice(1, 2, &[0.25, -1.5]);
        let tensor = CoefficientTensor::from_matrix(&coef, DesignShape::new(1, 1, 2)).unwrap();
        let loaded = CoefficientTensor::from_json(&tensor.json_dump().unwrap()).unwrap();
        assert_eq!(tensor, loaded);
    }
}
