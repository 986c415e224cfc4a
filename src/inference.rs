//! Inference
//!
//! Confidence intervals for linear functionals of the final-stage
//! coefficients. Every quantity the estimator reports (coefficients, constant
//! marginal effects, effects, average effects) is `aᵀ β_l` for some vector `a`
//! over the design columns and an outcome column `l`, so one routine serves
//! them all:
//!
//! * Asymptotic: `aᵀβ ± z_{1-α/2} · sqrt(aᵀ Σ a)` from the final model's covariance.
//! * Bootstrap: percentiles of `aᵀβ*` over refits of the final model on
//!   resampled final-stage rows.
use crate::data::{take_rows, take_weights};
use crate::errors::DmlError;
use crate::final_stage::{DesignShape, FinalModel};
use crate::utils::{percentiles, validate_float_parameter};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// How the estimator produces intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Inference {
    /// Point estimates only.
    #[default]
    None,
    /// Normal approximation using the final model's parameter covariance.
    Asymptotic,
    /// Percentile intervals from refits on resampled final-stage rows.
    Bootstrap { n_bootstrap_samples: usize },
}

/// A lower and upper bound.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval<T> {
    pub lower: T,
    pub upper: T,
}

/// The uncertainty information kept with a fitted estimator.
#[derive(Debug, Clone)]
pub enum Uncertainty {
    /// One `p × p` covariance per outcome column.
    Asymptotic { covariance: Vec<DMatrix<f64>> },
    /// One `d_y × p` coefficient matrix per bootstrap draw.
    Bootstrap { draws: Vec<DMatrix<f64>> },
}

/// Two-sided critical value `z_{1 - alpha / 2}` of the standard normal.
pub fn normal_critical_value(alpha: f64) -> Result<f64, DmlError> {
    validate_alpha(alpha)?;
    let normal = Normal::new(0.0, 1.0).map_err(|e| DmlError::Configuration(e.to_string()))?;
    Ok(normal.inverse_cdf(1.0 - alpha / 2.0))
}

/// `alpha` must lie strictly between 0 and 1.
pub fn validate_alpha(alpha: f64) -> Result<(), DmlError> {
    validate_float_parameter(alpha, 0.0, 1.0, "alpha")?;
    if alpha == 0.0 || alpha == 1.0 {
        return Err(DmlError::InvalidParameter(
            "alpha".to_string(),
            "real value strictly between 0 and 1".to_string(),
            alpha.to_string(),
        ));
    }
    Ok(())
}

impl Uncertainty {
    /// Interval of `aᵀ β_l`, where `coef` is the `d_y × p` point estimate.
    pub fn linear_interval(
        &self,
        coef: &DMatrix<f64>,
        outcome: usize,
        a: &DVector<f64>,
        alpha: f64,
    ) -> Result<Interval<f64>, DmlError> {
        match self {
            Uncertainty::Asymptotic { covariance } => {
                let z = normal_critical_value(alpha)?;
                let estimate = coef.row(outcome).transpose().dot(a);
                let var = (a.transpose() * &covariance[outcome] * a)[(0, 0)].max(0.0);
                let half = z * var.sqrt();
                Ok(Interval {
                    lower: estimate - half,
                    upper: estimate + half,
                })
            }
            Uncertainty::Bootstrap { draws } => {
                validate_alpha(alpha)?;
                let values: Vec<f64> = draws.iter().map(|d| d.row(outcome).transpose().dot(a)).collect();
                let weights = vec![1.0; values.len()];
                let bounds = percentiles(&values, &weights, &[alpha / 2.0, 1.0 - alpha / 2.0]);
                Ok(Interval {
                    lower: bounds[0],
                    upper: bounds[1],
                })
            }
        }
    }
}

/// Refit clones of `model` on `n_draws` row resamples of the final-stage data.
///
/// Draw `b` is seeded with `seed + 1 + b`, so the result does not depend on
/// how draws are scheduled across threads.
#[allow(clippy::too_many_arguments)]
pub fn bootstrap_coefficients<M: FinalModel + Clone>(
    model: &M,
    design: &DMatrix<f64>,
    target: &DMatrix<f64>,
    shape: DesignShape,
    sample_weight: Option<&[f64]>,
    n_draws: usize,
    seed: u64,
) -> Result<Vec<DMatrix<f64>>, DmlError> {
    let n = design.nrows();
    if n == 0 {
        return Err(DmlError::Configuration("cannot bootstrap an empty sample".to_string()));
    }
    (0..n_draws)
        .into_par_iter()
        .map(|b| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1).wrapping_add(b as u64));
            let index: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let w = take_weights(sample_weight, &index);
            let mut m = model.clone();
            m.fit(&take_rows(design, &index), &take_rows(target, &index), shape, w.as_deref())?;
            m.coefficients().cloned().ok_or(DmlError::NotFitted)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::final_stage::FinalRegression;

    #[test]
    fn test_critical_value() {
        assert!((normal_critical_value(0.05).unwrap() - 1.959963984540054).abs() < 1e-9);
        assert!((normal_critical_value(0.1).unwrap() - 1.6448536269514722).abs() < 1e-9);
        assert!(normal_critical_value(0.0).is_err());
        assert!(normal_critical_value(1.5).is_err());
    }

    #[test]
    fn test_asymptotic_interval() {
        let coef = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.09]);
        let u = Uncertainty::Asymptotic { covariance: vec![cov] };
        let a = DVector::from_vec(vec![0.0, 1.0]);
        let iv = u.linear_interval(&coef, 0, &a, 0.05).unwrap();
        let z = 1.959963984540054;
        assert!((iv.lower - (2.0 - z * 0.3)).abs() < 1e-9);
        assert!((iv.upper - (2.0 + z * 0.3)).abs() < 1e-9);
    }

    #[test]
    fn test_bootstrap_interval_percentiles() {
        let draws: Vec<DMatrix<f64>> = (1..=100).map(|v| DMatrix::from_element(1, 1, v as f64)).collect();
        let u = Uncertainty::Bootstrap { draws };
        let coef = DMatrix::from_element(1, 1, 50.0);
        let iv = u.linear_interval(&coef, 0, &DVector::from_element(1, 1.0), 0.1).unwrap();
        assert!(iv.lower >= 5.0 && iv.lower <= 6.0);
        assert!(iv.upper >= 95.0 && iv.upper <= 96.0);
    }

    #[test]
    fn test_bootstrap_is_reproducible() {
        let z = DMatrix::from_fn(40, 1, |i, _| (i as f64 * 0.37).sin() + 1.5);
        let y = DMatrix::from_fn(40, 1, |i, _| 2.0 * z[(i, 0)] + (i as f64 * 1.3).cos() * 0.1);
        let model = FinalRegression::ols();
        let shape = DesignShape::new(1, 1, 1);
        let a = bootstrap_coefficients(&model, &z, &y, shape, None, 20, 7).unwrap();
        let b = bootstrap_coefficients(&model, &z, &y, shape, None, 20, 7).unwrap();
        assert_eq!(a.len(), 20);
        assert_eq!(a, b);
        assert!(a.iter().all(|d| (d[(0, 0)] - 2.0).abs() < 0.2));
    }

    #[test]
    fn test_inference_serde() {
        let s = serde_json::to_string(&Inference::Bootstrap { n_bootstrap_samples: 50 }).unwrap();
        assert_eq!(s, r#"{"Bootstrap":{"n_bootstrap_samples":50}}"#);
        let back: Inference = serde_json::from_str(r#""Asymptotic""#).unwrap();
        assert_eq!(back, Inference::Asymptotic);
    }
}
