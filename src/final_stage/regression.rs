//! The built-in final model, dispatching on its regularizer.
use crate::errors::DmlError;
use crate::final_stage::elastic_net::fit_elastic_net;
use crate::final_stage::nuclear::fit_nuclear_norm;
use crate::final_stage::ols::fit_ols;
use crate::final_stage::{DesignShape, FinalModel};
use crate::utils::{validate_float_parameter, validate_min_usize_parameter, validate_positive_float_parameter};
use log::{debug, warn};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Penalty of the final-stage regression.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Regularizer {
    /// Ordinary least squares. The only variant with a parameter covariance.
    #[default]
    None,
    Lasso { alpha: f64 },
    ElasticNet { alpha: f64, l1_ratio: f64 },
    /// Low-rank penalty on every per-feature `d_y × d_t` coefficient slice.
    NuclearNorm { lambda: f64 },
}

/// Covariance estimator of the unregularized fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CovType {
    /// Homoskedastic, `s² (ZᵀWZ)⁻¹`.
    Nonrobust,
    /// White's heteroskedasticity-robust sandwich.
    HC0,
    /// HC0 with the small-sample factor `n / (n - p)`.
    #[default]
    HC1,
}

fn default_max_iter() -> usize {
    5000
}
fn default_tol() -> f64 {
    1e-8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalRegression {
    #[serde(default)]
    pub regularizer: Regularizer,
    #[serde(default)]
    pub cov_type: CovType,
    /// Iteration cap of the iterative solvers.
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    /// Relative coefficient-change tolerance of the iterative solvers.
    #[serde(default = "default_tol")]
    pub tol: f64,
    #[serde(skip)]
    coef: Option<DMatrix<f64>>,
    #[serde(skip)]
    covariance: Option<Vec<DMatrix<f64>>>,
    #[serde(skip)]
    warnings: Vec<String>,
    #[serde(skip)]
    n_iter: Option<usize>,
}

impl Default for FinalRegression {
    fn default() -> Self {
        FinalRegression::new(Regularizer::None)
    }
}

impl FinalRegression {
    pub fn new(regularizer: Regularizer) -> Self {
        FinalRegression {
            regularizer,
            cov_type: CovType::default(),
            max_iter: default_max_iter(),
            tol: default_tol(),
            coef: None,
            covariance: None,
            warnings: Vec::new(),
            n_iter: None,
        }
    }

    pub fn ols() -> Self {
        FinalRegression::new(Regularizer::None)
    }

    pub fn lasso(alpha: f64) -> Self {
        FinalRegression::new(Regularizer::Lasso { alpha })
    }

    pub fn elastic_net(alpha: f64, l1_ratio: f64) -> Self {
        FinalRegression::new(Regularizer::ElasticNet { alpha, l1_ratio })
    }

    pub fn nuclear_norm(lambda: f64) -> Self {
        FinalRegression::new(Regularizer::NuclearNorm { lambda })
    }

    pub fn set_cov_type(mut self, cov_type: CovType) -> Self {
        self.cov_type = cov_type;
        self
    }

    pub fn set_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn set_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    /// Iterations used by the last nuclear-norm fit.
    pub fn n_iter(&self) -> Option<usize> {
        self.n_iter
    }

    fn validate(&self) -> Result<(), DmlError> {
        match self.regularizer {
            Regularizer::None => {}
            Regularizer::Lasso { alpha } => validate_positive_float_parameter(alpha, "alpha")?,
            Regularizer::ElasticNet { alpha, l1_ratio } => {
                validate_positive_float_parameter(alpha, "alpha")?;
                validate_float_parameter(l1_ratio, 0.0, 1.0, "l1_ratio")?;
            }
            Regularizer::NuclearNorm { lambda } => validate_positive_float_parameter(lambda, "lambda")?,
        }
        validate_min_usize_parameter(self.max_iter, 1, "max_iter")?;
        validate_positive_float_parameter(self.tol, "tol")
    }

    fn not_converged(&mut self, what: String) {
        let msg = format!("{what} did not converge in {} iterations", self.max_iter);
        warn!("{}", msg);
        self.warnings.push(msg);
    }
}

impl FinalModel for FinalRegression {
    fn fit(
        &mut self,
        design: &DMatrix<f64>,
        target: &DMatrix<f64>,
        shape: DesignShape,
        sample_weight: Option<&[f64]>,
    ) -> Result<(), DmlError> {
        self.validate()?;
        if design.ncols() != shape.n_columns() || target.ncols() != shape.d_y || design.nrows() != target.nrows() {
            return Err(DmlError::Configuration(format!(
                "final stage got a {} x {} design and a {} x {} target for shape {:?}",
                design.nrows(),
                design.ncols(),
                target.nrows(),
                target.ncols(),
                shape
            )));
        }
        self.coef = None;
        self.covariance = None;
        self.warnings.clear();
        self.n_iter = None;

        match self.regularizer {
            Regularizer::None => {
                let fit = fit_ols(design, target, sample_weight, self.cov_type)?;
                self.coef = Some(fit.coef);
                self.covariance = Some(fit.covariance);
            }
            Regularizer::Lasso { alpha } => {
                let fit = fit_elastic_net(design, target, sample_weight, alpha, 1.0, self.max_iter, self.tol)?;
                for (l, ok) in fit.converged.iter().enumerate() {
                    if !ok {
                        self.not_converged(format!("lasso for outcome {l}"));
                    }
                }
                self.coef = Some(fit.coef);
            }
            Regularizer::ElasticNet { alpha, l1_ratio } => {
                let fit = fit_elastic_net(design, target, sample_weight, alpha, l1_ratio, self.max_iter, self.tol)?;
                for (l, ok) in fit.converged.iter().enumerate() {
                    if !ok {
                        self.not_converged(format!("elastic net for outcome {l}"));
                    }
                }
                self.coef = Some(fit.coef);
            }
            Regularizer::NuclearNorm { lambda } => {
                let fit = fit_nuclear_norm(design, target, shape, sample_weight, lambda, self.max_iter, self.tol)?;
                debug!("Nuclear norm FISTA stopped after {} iterations.", fit.iterations);
                if !fit.converged {
                    self.not_converged("nuclear norm FISTA".to_string());
                }
                self.n_iter = Some(fit.iterations);
                self.coef = Some(fit.coef);
            }
        }
        Ok(())
    }

    fn coefficients(&self) -> Option<&DMatrix<f64>> {
        self.coef.as_ref()
    }

    fn covariance(&self) -> Option<&[DMatrix<f64>]> {
        self.covariance.as_deref()
    }

    fn diagnostics(&self) -> Vec<String> {
        self.warnings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> (DMatrix<f64>, DMatrix<f64>) {
        let z = DMatrix::from_row_slice(6, 2, &[1.0, 0.2, -1.0, 0.5, 0.5, -1.0, 2.0, 1.0, -0.3, 0.3, 1.2, -0.7]);
        let y = DMatrix::from_fn(6, 1, |i, _| 2.0 * z[(i, 0)] - 1.0 * z[(i, 1)]);
        (z, y)
    }

    #[test]
    fn test_ols_dispatch_has_covariance() {
        let (z, y) = data();
        let mut m = FinalRegression::ols();
        m.fit(&z, &y, DesignShape::new(1, 2, 1), None).unwrap();
        let c = m.coefficients().unwrap();
        assert!((c[(0, 0)] - 2.0).abs() < 1e-10);
        assert!((c[(0, 1)] + 1.0).abs() < 1e-10);
        assert_eq!(m.covariance().map(|c| c.len()), Some(1));
        let pred = m.predict(&z).unwrap();
        assert!((pred - &y).amax() < 1e-10);
    }

    #[test]
    fn test_regularized_models_have_no_covariance() {
        let (z, y) = data();
        for mut m in [
            FinalRegression::lasso(0.01),
            FinalRegression::elastic_net(0.01, 0.5),
            FinalRegression::nuclear_norm(0.01),
        ] {
            m.fit(&z, &y, DesignShape::new(1, 2, 1), None).unwrap();
            assert!(m.covariance().is_none());
            let c = m.coefficients().unwrap();
            assert!((c[(0, 0)] - 2.0).abs() < 0.1);
            assert!((c[(0, 1)] + 1.0).abs() < 0.1);
        }
    }

    #[test]
    fn test_invalid_parameters() {
        let (z, y) = data();
        let shape = DesignShape::new(1, 2, 1);
        assert!(matches!(
            FinalRegression::lasso(-1.0).fit(&z, &y, shape, None),
            Err(DmlError::InvalidParameter(..))
        ));
        assert!(FinalRegression::elastic_net(0.1, 1.5).fit(&z, &y, shape, None).is_err());
        assert!(FinalRegression::ols().fit(&z, &y, DesignShape::new(1, 3, 1), None).is_err());
    }

    #[test]
    fn test_non_convergence_is_a_diagnostic() {
        let (z, y) = data();
        let mut m = FinalRegression::lasso(0.001).set_max_iter(1).set_tol(0.0);
        m.fit(&z, &y, DesignShape::new(1, 2, 1), None).unwrap();
        assert_eq!(m.diagnostics().len(), 1);
    }

    #[test]
    fn test_nuclear_norm_reports_iterations() {
        let (z, y) = data();
        let mut m = FinalRegression::nuclear_norm(0.01).set_max_iter(2000);
        m.fit(&z, &y, DesignShape::new(1, 2, 1), None).unwrap();
        let used = m.n_iter().unwrap();
        assert!((1..=2000).contains(&used));

        let mut capped = FinalRegression::nuclear_norm(0.01).set_max_iter(2).set_tol(0.0);
        capped.fit(&z, &y, DesignShape::new(1, 2, 1), None).unwrap();
        assert_eq!(capped.n_iter(), Some(2));
        assert_eq!(capped.diagnostics().len(), 1);

        let mut ols = FinalRegression::ols();
        ols.fit(&z, &y, DesignShape::new(1, 2, 1), None).unwrap();
        assert_eq!(ols.n_iter(), None);
    }

    #[test]
    fn test_predict_before_fit() {
        let (z, _) = data();
        assert!(matches!(FinalRegression::ols().predict(&z), Err(DmlError::NotFitted)));
    }

    #[test]
    fn test_serde_keeps_settings_only() {
        let m = FinalRegression::elastic_net(0.3, 0.2).set_cov_type(CovType::HC0);
        let s = serde_json::to_string(&m).unwrap();
        let back: FinalRegression = serde_json::from_str(&s).unwrap();
        assert_eq!(back.regularizer, m.regularizer);
        assert_eq!(back.cov_type, CovType::HC0);
        assert!(back.coefficients().is_none());
    }
}
