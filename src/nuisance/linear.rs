//! Weighted linear least squares with an optional ridge penalty.
use crate::errors::DmlError;
use crate::nuisance::Regressor;
use crate::utils::validate_positive_float_parameter;
use nalgebra::{DMatrix, DVector};

/// Relative cut-off under which singular values are treated as zero.
const SINGULAR_VALUE_RTOL: f64 = 1e-12;

/// Linear regression `y ≈ intercept + x · coef`.
///
/// Minimises `Σ wᵢ (yᵢ − intercept − xᵢ·coef)² + alpha ‖coef‖²` through an SVD
/// of the centred, weighted design, so collinear inputs yield the minimum-norm
/// solution instead of an error. With zero input columns the fit reduces to
/// the weighted mean of `y`.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    pub fit_intercept: bool,
    pub alpha: f64,
    coef: Option<DVector<f64>>,
    intercept: f64,
}

impl Default for LinearRegression {
    fn default() -> Self {
        LinearRegression::new(true, 0.0)
    }
}

impl LinearRegression {
    pub fn new(fit_intercept: bool, alpha: f64) -> Self {
        LinearRegression {
            fit_intercept,
            alpha,
            coef: None,
            intercept: 0.0,
        }
    }

    /// Ridge regression with penalty `alpha`.
    pub fn ridge(alpha: f64) -> Self {
        LinearRegression::new(true, alpha)
    }

    pub fn coef(&self) -> Option<&DVector<f64>> {
        self.coef.as_ref()
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }
}

impl Regressor for LinearRegression {
    fn fit(&mut self, x: &DMatrix<f64>, y: &DVector<f64>, sample_weight: Option<&[f64]>) -> Result<(), DmlError> {
        validate_positive_float_parameter(self.alpha, "alpha")?;
        let (n, p) = x.shape();
        if y.len() != n {
            return Err(DmlError::Configuration(format!(
                "linear regression got {n} feature rows and {} targets",
                y.len()
            )));
        }
        if n == 0 {
            return Err(DmlError::Configuration("linear regression needs at least one row".to_string()));
        }
        let w: Vec<f64> = match sample_weight {
            Some(w) => w.to_vec(),
            None => vec![1.0; n],
        };
        let w_total: f64 = w.iter().sum();

        let (x_mean, y_mean) = if self.fit_intercept {
            let x_mean = DVector::from_fn(p, |j, _| {
                x.column(j).iter().zip(&w).map(|(v, wi)| v * wi).sum::<f64>() / w_total
            });
            let y_mean = y.iter().zip(&w).map(|(v, wi)| v * wi).sum::<f64>() / w_total;
            (x_mean, y_mean)
        } else {
            (DVector::zeros(p), 0.0)
        };

        if p == 0 {
            self.coef = Some(DVector::zeros(0));
            self.intercept = y_mean;
            return Ok(());
        }

        let ridge_rows = if self.alpha > 0.0 { p } else { 0 };
        let mut a = DMatrix::zeros(n + ridge_rows, p);
        let mut b = DVector::zeros(n + ridge_rows);
        for i in 0..n {
            let sw = w[i].sqrt();
            for j in 0..p {
                a[(i, j)] = sw * (x[(i, j)] - x_mean[j]);
            }
            b[i] = sw * (y[i] - y_mean);
        }
        let ridge = self.alpha.sqrt();
        for j in 0..ridge_rows {
            a[(n + j, j)] = ridge;
        }

        let svd = a.svd(true, true);
        let s_max = svd.singular_values.max();
        let eps = s_max * SINGULAR_VALUE_RTOL * (n.max(p) as f64);
        let coef = svd.solve(&b, eps).map_err(|e| DmlError::NuisanceFit {
            model: "LinearRegression".to_string(),
            reason: e.to_string(),
        })?;

        self.intercept = y_mean - x_mean.dot(&coef);
        self.coef = Some(coef);
        Ok(())
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, DmlError> {
        let coef = self.coef.as_ref().ok_or(DmlError::NotFitted)?;
        if x.ncols() != coef.len() {
            return Err(DmlError::Configuration(format!(
                "linear regression was fitted on {} columns, {} provided",
                coef.len(),
                x.ncols()
            )));
        }
        let mut out = DVector::from_element(x.nrows(), self.intercept);
        if !coef.is_empty() {
            out += x * coef;
        }
        Ok(out)
    }
}
