//! Double Machine Learning Estimator
//!
//! Fits the partially linear model
//!
//! $$Y = \theta(X) \cdot T + g(X, W) + \epsilon, \quad T = f(X, W) + \eta$$
//!
//! with $\theta(X) = B \, \Phi(X)$, in one forward pass:
//!
//! 1. Split rows into K folds (stratified by category for a discrete treatment),
//!    or with the splitter given to `set_splitter`.
//! 2. Cross-fit the outcome and treatment nuisance models on `[X | W]` and
//!    keep the out-of-fold residuals $\tilde{Y}$ and $\tilde{T}$. The feature
//!    basis $\Phi(X)$ is built concurrently on the full sample.
//! 3. Regress $\tilde{Y}$ on $\tilde{T} \otimes \Phi(X)$ with the final model.
//! 4. Optionally refit the final model on bootstrap resamples of its rows.
//!
//! The result is an immutable [`FittedDml`]. The estimator only swaps it in
//! once every step has succeeded, so a failed fit leaves the previous result
//! in place.
use crate::config::DmlConfig;
use crate::data::{hstack, validate_sample_weight, Matrix};
use crate::errors::DmlError;
use crate::featurizer::{Featurizer, PolynomialFeatures};
use crate::final_stage::{cross_product_design, CoefficientTensor, DesignShape, FinalModel, FinalRegression};
use crate::folds::{FoldSplitter, KFold, StratifiedKFold};
use crate::inference::{bootstrap_coefficients, Inference, Interval, Uncertainty};
use crate::nuisance::{LinearRegression, MultiOutputRegressor, NuisanceModel};
use crate::residualizer::crossfit;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;
use std::time::Instant;

pub mod fitted;
pub mod treatment;

pub use fitted::{FitDiagnostics, FittedDml};
pub use treatment::TreatmentEncoder;

use fitted::final_score;

/// Linear nuisance models, linear-in-X effects and an OLS final stage.
pub type LinearDml = DmlEstimator<MultiOutputRegressor<LinearRegression>, MultiOutputRegressor<LinearRegression>>;

/// Cross-fitted DML estimator.
///
/// * `MY` - Outcome nuisance model, estimates `E[Y | X, W]`.
/// * `MT` - Treatment nuisance model, estimates `E[T | X, W]`.
/// * `F` - Featurizer producing the effect basis `Φ(X)`.
/// * `M` - Final-stage model.
#[derive(Debug, Clone)]
pub struct DmlEstimator<MY, MT, F = PolynomialFeatures, M = FinalRegression> {
    pub config: DmlConfig,
    model_y: MY,
    model_t: MT,
    featurizer: F,
    final_model: M,
    splitter: Option<Arc<dyn FoldSplitter>>,
    fitted: Option<FittedDml<MY, MT, F, M>>,
}

impl<MY, MT> DmlEstimator<MY, MT, PolynomialFeatures, FinalRegression> {
    /// Estimator with the default configuration, a linear effect basis
    /// `[1, X]` and an OLS final stage.
    pub fn new(model_y: MY, model_t: MT) -> Self {
        DmlEstimator {
            config: DmlConfig::default(),
            model_y,
            model_t,
            featurizer: PolynomialFeatures::default(),
            final_model: FinalRegression::default(),
            splitter: None,
            fitted: None,
        }
    }
}

impl LinearDml {
    /// Linear regression for both nuisance models.
    pub fn linear() -> Self {
        DmlEstimator::new(
            MultiOutputRegressor::new(LinearRegression::default()),
            MultiOutputRegressor::new(LinearRegression::default()),
        )
    }
}

impl<MY, MT, F, M> DmlEstimator<MY, MT, F, M> {
    /// Set the configuration.
    /// * `config` - The estimator configuration.
    pub fn set_config(mut self, config: DmlConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the featurizer. Discards any fitted state.
    pub fn set_featurizer<F2>(self, featurizer: F2) -> DmlEstimator<MY, MT, F2, M> {
        DmlEstimator {
            config: self.config,
            model_y: self.model_y,
            model_t: self.model_t,
            featurizer,
            final_model: self.final_model,
            splitter: self.splitter,
            fitted: None,
        }
    }

    /// Replace the final model. Discards any fitted state.
    pub fn set_final_model<M2>(self, final_model: M2) -> DmlEstimator<MY, MT, F, M2> {
        DmlEstimator {
            config: self.config,
            model_y: self.model_y,
            model_t: self.model_t,
            featurizer: self.featurizer,
            final_model,
            splitter: self.splitter,
            fitted: None,
        }
    }

    /// Use `splitter` for cross-fitting instead of the `KFold` (or, for a
    /// discrete treatment, `StratifiedKFold`) built from the configuration.
    /// A `FoldAssignment` fixes the folds explicitly.
    pub fn set_splitter<S: FoldSplitter + 'static>(mut self, splitter: S) -> Self {
        self.splitter = Some(Arc::new(splitter));
        self
    }

    pub fn model_y(&self) -> &MY {
        &self.model_y
    }

    pub fn model_t(&self) -> &MT {
        &self.model_t
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// The result of the last successful fit.
    pub fn fitted(&self) -> Result<&FittedDml<MY, MT, F, M>, DmlError> {
        self.fitted.as_ref().ok_or(DmlError::NotFitted)
    }
}

fn to_owned_present(m: Option<&Matrix<f64>>, name: &str) -> Result<Option<DMatrix<f64>>, DmlError> {
    match m {
        Some(m) if m.cols > 0 => Ok(Some(m.to_dmatrix(name)?)),
        _ => Ok(None),
    }
}

impl<MY, MT, F, M> DmlEstimator<MY, MT, F, M>
where
    MY: NuisanceModel + Clone,
    MT: NuisanceModel + Clone,
    F: Featurizer + Clone,
    M: FinalModel + Clone,
{
    /// Fit the estimator.
    ///
    /// * `y` - Outcomes, `n × d_y`.
    /// * `t` - Treatments, `n × d_t`; a single column of category values for a
    ///   discrete treatment.
    /// * `x` - Optional heterogeneity covariates, `n × d_x`.
    /// * `w` - Optional controls, `n × d_w`, used only by the nuisance models.
    /// * `sample_weight` - Optional non-negative weight per row.
    pub fn fit(
        &mut self,
        y: &Matrix<f64>,
        t: &Matrix<f64>,
        x: Option<&Matrix<f64>>,
        w: Option<&Matrix<f64>>,
        sample_weight: Option<&[f64]>,
    ) -> Result<&FittedDml<MY, MT, F, M>, DmlError> {
        let fitted = self.fit_new(y, t, x, w, sample_weight)?;
        Ok(&*self.fitted.insert(fitted))
    }

    fn fit_new(
        &self,
        y: &Matrix<f64>,
        t: &Matrix<f64>,
        x: Option<&Matrix<f64>>,
        w: Option<&Matrix<f64>>,
        sample_weight: Option<&[f64]>,
    ) -> Result<FittedDml<MY, MT, F, M>, DmlError> {
        let start = Instant::now();
        self.config.validate()?;

        let y = y.to_dmatrix("Y")?;
        let t_raw = t.to_dmatrix("T")?;
        let x = to_owned_present(x, "X")?;
        let w = to_owned_present(w, "W")?;
        let n = y.nrows();
        if n == 0 || y.ncols() == 0 {
            return Err(DmlError::Configuration(
                "Y needs at least one row and one column".to_string(),
            ));
        }
        for (name, rows) in [
            ("T", Some(t_raw.nrows())),
            ("X", x.as_ref().map(|m| m.nrows())),
            ("W", w.as_ref().map(|m| m.nrows())),
        ] {
            if let Some(rows) = rows {
                if rows != n {
                    return Err(DmlError::Configuration(format!("Y has {n} rows but {name} has {rows}")));
                }
            }
        }
        validate_sample_weight(sample_weight, n)?;

        let encoder = TreatmentEncoder::fit(&t_raw, self.config.discrete_treatment)?;
        let t = encoder.encode(&t_raw)?;
        let strata = encoder.labels(&t_raw)?;
        let folds = match (&self.splitter, strata) {
            (Some(splitter), strata) => splitter.split(n, strata.as_deref())?,
            (None, Some(labels)) => StratifiedKFold::new(self.config.n_folds, self.config.shuffle, self.config.seed)
                .split(n, Some(&labels))?,
            (None, None) => KFold::new(self.config.n_folds, self.config.shuffle, self.config.seed).split(n, None)?,
        };
        if folds.n_rows() != n {
            return Err(DmlError::Configuration(format!(
                "the splitter assigned {} rows, expected {n}",
                folds.n_rows()
            )));
        }

        let empty = DMatrix::zeros(n, 0);
        let x_ref = x.as_ref().unwrap_or(&empty);
        let w_ref = w.as_ref().unwrap_or(&empty);
        let features = hstack(n, &[x_ref, w_ref]);
        let (d_y, d_t, d_x, d_w) = (y.ncols(), t.ncols(), x_ref.ncols(), w_ref.ncols());

        let n_threads_available = std::thread::available_parallelism().map_or(1, |p| p.get());
        let num_threads = self.config.num_threads.unwrap_or(n_threads_available);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| DmlError::Configuration(e.to_string()))?;

        info!(
            "Fitting DML estimator on {} rows with {} folds (d_y: {}, d_t: {}, d_x: {}, d_w: {}).",
            n, folds.n_folds(), d_y, d_t, d_x, d_w
        );

        let (residuals, basis) = pool.install(|| {
            rayon::join(
                || crossfit(&self.model_y, &self.model_t, &folds, &features, &y, &t, sample_weight),
                || self.featurize(x.as_ref(), n),
            )
        });
        let residuals = residuals?;
        let (featurizer, phi) = basis?;

        for warning in &residuals.warnings {
            warn!("{} in fold {}: {}", warning.model, warning.fold, warning.message);
        }

        let shape = DesignShape::new(d_y, d_t, phi.ncols());
        let design = cross_product_design(&residuals.t_residuals, &phi)?;
        let mut final_model = self.final_model.clone();
        final_model.fit(&design, &residuals.y_residuals, shape, sample_weight)?;
        let coef_matrix = final_model.coefficients().cloned().ok_or(DmlError::NotFitted)?;
        let coef = CoefficientTensor::from_matrix(&coef_matrix, shape)?;

        let uncertainty = match self.config.inference {
            Inference::None => None,
            Inference::Asymptotic => match final_model.covariance() {
                Some(covariance) => Some(Uncertainty::Asymptotic {
                    covariance: covariance.to_vec(),
                }),
                None => {
                    warn!("Asymptotic inference was requested but the final model has no parameter covariance, intervals will be unavailable.");
                    None
                }
            },
            Inference::Bootstrap { n_bootstrap_samples } => {
                let draws = pool.install(|| {
                    bootstrap_coefficients(
                        &self.final_model,
                        &design,
                        &residuals.y_residuals,
                        shape,
                        sample_weight,
                        n_bootstrap_samples,
                        self.config.seed,
                    )
                })?;
                Some(Uncertainty::Bootstrap { draws })
            }
        };

        let final_residuals = &residuals.y_residuals - final_model.predict(&design)?;
        let score = final_score(&final_residuals, sample_weight);
        let final_warnings = final_model.diagnostics();

        info!(
            "Finished fitting DML estimator in {} seconds, final stage score: {:.6}.",
            start.elapsed().as_secs_f32(),
            score
        );

        Ok(FittedDml {
            config: self.config.clone(),
            diagnostics: FitDiagnostics {
                nuisance_scores_y: residuals.nuisance_scores_y,
                nuisance_scores_t: residuals.nuisance_scores_t,
                final_score: score,
                fold_sizes: folds.sizes(),
                nuisance_warnings: residuals.warnings,
                final_warnings,
            },
            folds,
            models_y: residuals.models_y,
            models_t: residuals.models_t,
            y_residuals: residuals.y_residuals,
            t_residuals: residuals.t_residuals,
            featurizer,
            d_x,
            d_w,
            encoder,
            final_model,
            shape,
            coef,
            coef_matrix,
            uncertainty,
        })
    }

    // The effect basis on the full sample, a column of ones without X.
    fn featurize(&self, x: Option<&DMatrix<f64>>, n: usize) -> Result<(Option<F>, DMatrix<f64>), DmlError> {
        match x {
            None => Ok((None, DMatrix::from_element(n, 1, 1.0))),
            Some(x) => {
                let mut featurizer = self.featurizer.clone();
                let phi = featurizer.fit_transform(x)?;
                if phi.nrows() != n || phi.ncols() == 0 {
                    return Err(DmlError::Configuration(format!(
                        "featurizer returned a ({}, {}) basis for {n} rows",
                        phi.nrows(),
                        phi.ncols()
                    )));
                }
                Ok((Some(featurizer), phi))
            }
        }
    }

    pub fn const_marginal_effect(&self, x: Option<&Matrix<f64>>) -> Result<Vec<DMatrix<f64>>, DmlError> {
        self.fitted()?.const_marginal_effect(x)
    }

    pub fn const_marginal_effect_interval(
        &self,
        x: Option<&Matrix<f64>>,
        alpha: f64,
    ) -> Result<Interval<Vec<DMatrix<f64>>>, DmlError> {
        self.fitted()?.const_marginal_effect_interval(x, alpha)
    }

    pub fn marginal_effect(&self, t: &Matrix<f64>, x: Option<&Matrix<f64>>) -> Result<Vec<DMatrix<f64>>, DmlError> {
        self.fitted()?.marginal_effect(t, x)
    }

    pub fn const_marginal_ate(&self, x: Option<&Matrix<f64>>) -> Result<DMatrix<f64>, DmlError> {
        self.fitted()?.const_marginal_ate(x)
    }

    pub fn effect(&self, x: Option<&Matrix<f64>>, t0: &Matrix<f64>, t1: &Matrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        self.fitted()?.effect(x, t0, t1)
    }

    pub fn effect_interval(
        &self,
        x: Option<&Matrix<f64>>,
        t0: &Matrix<f64>,
        t1: &Matrix<f64>,
        alpha: f64,
    ) -> Result<Interval<DMatrix<f64>>, DmlError> {
        self.fitted()?.effect_interval(x, t0, t1, alpha)
    }

    pub fn ate(&self, x: Option<&Matrix<f64>>, t0: &Matrix<f64>, t1: &Matrix<f64>) -> Result<DVector<f64>, DmlError> {
        self.fitted()?.ate(x, t0, t1)
    }

    pub fn ate_interval(
        &self,
        x: Option<&Matrix<f64>>,
        t0: &Matrix<f64>,
        t1: &Matrix<f64>,
        alpha: f64,
    ) -> Result<Interval<DVector<f64>>, DmlError> {
        self.fitted()?.ate_interval(x, t0, t1, alpha)
    }

    pub fn coef(&self) -> Result<&CoefficientTensor, DmlError> {
        Ok(self.fitted()?.coef())
    }

    pub fn coef_interval(&self, alpha: f64) -> Result<Interval<CoefficientTensor>, DmlError> {
        self.fitted()?.coef_interval(alpha)
    }

    pub fn feature_names(&self, input_names: Option<&[String]>) -> Result<Vec<String>, DmlError> {
        self.fitted()?.feature_names(input_names)
    }

    pub fn score(
        &self,
        y: &Matrix<f64>,
        t: &Matrix<f64>,
        x: Option<&Matrix<f64>>,
        w: Option<&Matrix<f64>>,
        sample_weight: Option<&[f64]>,
    ) -> Result<f64, DmlError> {
        self.fitted()?.score(y, t, x, w, sample_weight)
    }
}
