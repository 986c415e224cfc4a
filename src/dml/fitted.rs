//! The immutable result of a successful fit and every effect query.
use crate::config::DmlConfig;
use crate::data::{hstack, validate_sample_weight, Matrix};
use crate::dml::treatment::TreatmentEncoder;
use crate::errors::DmlError;
use crate::featurizer::{default_input_names, Featurizer};
use crate::final_stage::{cross_product_design, CoefficientTensor, DesignShape, FinalModel};
use crate::folds::FoldAssignment;
use crate::inference::{Inference, Interval, Uncertainty};
use crate::nuisance::NuisanceModel;
use crate::residualizer::NuisanceWarning;
use crate::utils::weighted_mse;
use nalgebra::{DMatrix, DVector};

/// Scores and warnings collected while fitting.
#[derive(Debug, Clone, PartialEq)]
pub struct FitDiagnostics {
    /// Held-out MSE of the outcome model, per fold.
    pub nuisance_scores_y: Vec<f64>,
    /// Held-out MSE of the treatment model, per fold.
    pub nuisance_scores_t: Vec<f64>,
    /// Weighted MSE of the final stage on the training residuals, averaged over outcomes.
    pub final_score: f64,
    pub fold_sizes: Vec<usize>,
    pub nuisance_warnings: Vec<NuisanceWarning>,
    pub final_warnings: Vec<String>,
}

/// Everything a successful `fit` produces. Queries never mutate it.
#[derive(Debug, Clone)]
pub struct FittedDml<MY, MT, F, M> {
    pub(crate) config: DmlConfig,
    pub(crate) folds: FoldAssignment,
    pub(crate) models_y: Vec<MY>,
    pub(crate) models_t: Vec<MT>,
    pub(crate) y_residuals: DMatrix<f64>,
    pub(crate) t_residuals: DMatrix<f64>,
    /// `None` when the fit had no heterogeneity covariates.
    pub(crate) featurizer: Option<F>,
    pub(crate) d_x: usize,
    pub(crate) d_w: usize,
    pub(crate) encoder: TreatmentEncoder,
    pub(crate) final_model: M,
    pub(crate) shape: DesignShape,
    pub(crate) coef: CoefficientTensor,
    pub(crate) coef_matrix: DMatrix<f64>,
    pub(crate) uncertainty: Option<Uncertainty>,
    pub(crate) diagnostics: FitDiagnostics,
}

// Zero-column inputs are the same as absent ones.
fn present<'a, 'b>(m: Option<&'a Matrix<'b, f64>>) -> Option<&'a Matrix<'b, f64>> {
    m.filter(|m| m.cols > 0)
}

fn broadcast_rows(m: &DMatrix<f64>, rows: usize, name: &str) -> Result<DMatrix<f64>, DmlError> {
    if m.nrows() == rows {
        Ok(m.clone())
    } else if m.nrows() == 1 {
        Ok(DMatrix::from_fn(rows, m.ncols(), |_, j| m[(0, j)]))
    } else {
        Err(DmlError::Configuration(format!(
            "{name} has {} rows, expected 1 or {rows}",
            m.nrows()
        )))
    }
}

impl<MY, MT, F, M> FittedDml<MY, MT, F, M>
where
    MY: NuisanceModel,
    MT: NuisanceModel,
    F: Featurizer,
    M: FinalModel,
{
    pub fn config(&self) -> &DmlConfig {
        &self.config
    }

    pub fn folds(&self) -> &FoldAssignment {
        &self.folds
    }

    /// Outcome models, one per fold.
    pub fn models_y(&self) -> &[MY] {
        &self.models_y
    }

    /// Treatment models, one per fold.
    pub fn models_t(&self) -> &[MT] {
        &self.models_t
    }

    pub fn y_residuals(&self) -> &DMatrix<f64> {
        &self.y_residuals
    }

    pub fn t_residuals(&self) -> &DMatrix<f64> {
        &self.t_residuals
    }

    pub fn featurizer(&self) -> Option<&F> {
        self.featurizer.as_ref()
    }

    pub fn final_model(&self) -> &M {
        &self.final_model
    }

    pub fn shape(&self) -> DesignShape {
        self.shape
    }

    pub fn diagnostics(&self) -> &FitDiagnostics {
        &self.diagnostics
    }

    /// Categories of a discrete treatment, baseline first.
    pub fn treatment_categories(&self) -> Option<&[f64]> {
        self.encoder.categories()
    }

    /// The `(d_y, d_t, d_phi)` coefficient tensor.
    pub fn coef(&self) -> &CoefficientTensor {
        &self.coef
    }

    /// Names of the feature basis columns. Defaults to `x0, x1, ...` for the inputs.
    pub fn feature_names(&self, input_names: Option<&[String]>) -> Result<Vec<String>, DmlError> {
        match &self.featurizer {
            None => Ok(vec!["1".to_string()]),
            Some(f) => match input_names {
                Some(names) => f.feature_names(names),
                None => f.feature_names(&default_input_names(self.d_x)),
            },
        }
    }

    /// Φ of the query rows; a single row of ones without heterogeneity.
    fn query_features(&self, x: Option<&Matrix<f64>>) -> Result<DMatrix<f64>, DmlError> {
        match (&self.featurizer, present(x)) {
            (None, None) => Ok(DMatrix::from_element(1, 1, 1.0)),
            (None, Some(x)) => Err(DmlError::Configuration(format!(
                "the estimator was fitted without X, but X with {} columns was provided",
                x.cols
            ))),
            (Some(_), None) => Err(DmlError::Configuration(format!(
                "the estimator was fitted with {} columns of X, none provided",
                self.d_x
            ))),
            (Some(f), Some(x)) => {
                if x.cols != self.d_x {
                    return Err(DmlError::Configuration(format!(
                        "the estimator was fitted with {} columns of X, {} provided",
                        self.d_x, x.cols
                    )));
                }
                f.transform(&x.to_dmatrix("X")?)
            }
        }
    }

    fn theta(&self, phi: &[f64]) -> DMatrix<f64> {
        DMatrix::from_fn(self.shape.d_y, self.shape.d_t, |i, j| {
            phi.iter().enumerate().map(|(k, p)| self.coef.get(i, j, k) * p).sum()
        })
    }

    /// Per-row coefficient functional `(T1 - T0) ⊗ Φ(x)`.
    fn effect_functionals(
        &self,
        x: Option<&Matrix<f64>>,
        t0: &Matrix<f64>,
        t1: &Matrix<f64>,
    ) -> Result<Vec<DVector<f64>>, DmlError> {
        let phi = self.query_features(x)?;
        let t0 = self.encoder.encode(&t0.to_dmatrix("T0")?)?;
        let t1 = self.encoder.encode(&t1.to_dmatrix("T1")?)?;
        let m = if present(x).is_some() {
            phi.nrows()
        } else {
            t0.nrows().max(t1.nrows())
        };
        let phi = broadcast_rows(&phi, m, "X")?;
        let t0 = broadcast_rows(&t0, m, "T0")?;
        let t1 = broadcast_rows(&t1, m, "T1")?;
        let d_phi = self.shape.d_phi;
        Ok((0..m)
            .map(|r| {
                DVector::from_fn(self.shape.n_columns(), |c, _| {
                    (t1[(r, c / d_phi)] - t0[(r, c / d_phi)]) * phi[(r, c % d_phi)]
                })
            })
            .collect())
    }

    // e_j ⊗ Φ(x) for every query row and treatment.
    fn marginal_functionals(&self, phi: &DMatrix<f64>) -> Vec<Vec<DVector<f64>>> {
        let d_phi = self.shape.d_phi;
        (0..phi.nrows())
            .map(|r| {
                (0..self.shape.d_t)
                    .map(|j| {
                        DVector::from_fn(self.shape.n_columns(), |c, _| {
                            if c / d_phi == j {
                                phi[(r, c % d_phi)]
                            } else {
                                0.0
                            }
                        })
                    })
                    .collect()
            })
            .collect()
    }

    fn uncertainty(&self) -> Result<&Uncertainty, DmlError> {
        match &self.uncertainty {
            Some(u) => Ok(u),
            None => Err(DmlError::IntervalUnsupported(match self.config.inference {
                Inference::None => "the estimator was fitted with `Inference::None`".to_string(),
                _ => "the final model does not expose a parameter covariance, use `Inference::Bootstrap`"
                    .to_string(),
            })),
        }
    }

    /// One `d_y × d_t` matrix `θ(x)` per query row; a single matrix when X is absent.
    pub fn const_marginal_effect(&self, x: Option<&Matrix<f64>>) -> Result<Vec<DMatrix<f64>>, DmlError> {
        let phi = self.query_features(x)?;
        Ok(phi
            .row_iter()
            .map(|row| self.theta(&row.iter().copied().collect::<Vec<f64>>()))
            .collect())
    }

    pub fn const_marginal_effect_interval(
        &self,
        x: Option<&Matrix<f64>>,
        alpha: f64,
    ) -> Result<Interval<Vec<DMatrix<f64>>>, DmlError> {
        let uncertainty = self.uncertainty()?;
        let phi = self.query_features(x)?;
        let mut lower = Vec::with_capacity(phi.nrows());
        let mut upper = Vec::with_capacity(phi.nrows());
        for per_treatment in self.marginal_functionals(&phi) {
            let mut lo = DMatrix::zeros(self.shape.d_y, self.shape.d_t);
            let mut hi = DMatrix::zeros(self.shape.d_y, self.shape.d_t);
            for (j, a) in per_treatment.iter().enumerate() {
                for i in 0..self.shape.d_y {
                    let iv = uncertainty.linear_interval(&self.coef_matrix, i, a, alpha)?;
                    lo[(i, j)] = iv.lower;
                    hi[(i, j)] = iv.upper;
                }
            }
            lower.push(lo);
            upper.push(hi);
        }
        Ok(Interval { lower, upper })
    }

    /// `∂Y/∂T` at the given treatment levels. The model is linear in T, so this
    /// is `θ(x)` repeated for every row of `t` when X is absent.
    pub fn marginal_effect(&self, t: &Matrix<f64>, x: Option<&Matrix<f64>>) -> Result<Vec<DMatrix<f64>>, DmlError> {
        let encoded = self.encoder.encode(&t.to_dmatrix("T")?)?;
        let cme = self.const_marginal_effect(x)?;
        if present(x).is_some() {
            if encoded.nrows() != 1 && encoded.nrows() != cme.len() {
                return Err(DmlError::Configuration(format!(
                    "T has {} rows, expected 1 or {}",
                    encoded.nrows(),
                    cme.len()
                )));
            }
            Ok(cme)
        } else {
            Ok(vec![cme[0].clone(); encoded.nrows()])
        }
    }

    /// Mean of `θ(x)` over the query rows.
    pub fn const_marginal_ate(&self, x: Option<&Matrix<f64>>) -> Result<DMatrix<f64>, DmlError> {
        let cme = self.const_marginal_effect(x)?;
        if cme.is_empty() {
            return Err(DmlError::Configuration("cannot average over zero query rows".to_string()));
        }
        let m = cme.len() as f64;
        Ok(cme
            .iter()
            .fold(DMatrix::zeros(self.shape.d_y, self.shape.d_t), |acc, t| acc + t)
            / m)
    }

    /// `θ(x) (T1 - T0)` per row, `m × d_y`.
    pub fn effect(&self, x: Option<&Matrix<f64>>, t0: &Matrix<f64>, t1: &Matrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        let functionals = self.effect_functionals(x, t0, t1)?;
        Ok(DMatrix::from_fn(functionals.len(), self.shape.d_y, |r, i| {
            self.coef_matrix.row(i).transpose().dot(&functionals[r])
        }))
    }

    pub fn effect_interval(
        &self,
        x: Option<&Matrix<f64>>,
        t0: &Matrix<f64>,
        t1: &Matrix<f64>,
        alpha: f64,
    ) -> Result<Interval<DMatrix<f64>>, DmlError> {
        let uncertainty = self.uncertainty()?;
        let functionals = self.effect_functionals(x, t0, t1)?;
        let mut lower = DMatrix::zeros(functionals.len(), self.shape.d_y);
        let mut upper = DMatrix::zeros(functionals.len(), self.shape.d_y);
        for (r, a) in functionals.iter().enumerate() {
            for i in 0..self.shape.d_y {
                let iv = uncertainty.linear_interval(&self.coef_matrix, i, a, alpha)?;
                lower[(r, i)] = iv.lower;
                upper[(r, i)] = iv.upper;
            }
        }
        Ok(Interval { lower, upper })
    }

    /// Average effect over the query rows, one entry per outcome.
    pub fn ate(&self, x: Option<&Matrix<f64>>, t0: &Matrix<f64>, t1: &Matrix<f64>) -> Result<DVector<f64>, DmlError> {
        let a = self.mean_functional(x, t0, t1)?;
        Ok(DVector::from_fn(self.shape.d_y, |i, _| self.coef_matrix.row(i).transpose().dot(&a)))
    }

    pub fn ate_interval(
        &self,
        x: Option<&Matrix<f64>>,
        t0: &Matrix<f64>,
        t1: &Matrix<f64>,
        alpha: f64,
    ) -> Result<Interval<DVector<f64>>, DmlError> {
        let uncertainty = self.uncertainty()?;
        let a = self.mean_functional(x, t0, t1)?;
        let mut lower = DVector::zeros(self.shape.d_y);
        let mut upper = DVector::zeros(self.shape.d_y);
        for i in 0..self.shape.d_y {
            let iv = uncertainty.linear_interval(&self.coef_matrix, i, &a, alpha)?;
            lower[i] = iv.lower;
            upper[i] = iv.upper;
        }
        Ok(Interval { lower, upper })
    }

    fn mean_functional(
        &self,
        x: Option<&Matrix<f64>>,
        t0: &Matrix<f64>,
        t1: &Matrix<f64>,
    ) -> Result<DVector<f64>, DmlError> {
        let functionals = self.effect_functionals(x, t0, t1)?;
        if functionals.is_empty() {
            return Err(DmlError::Configuration("cannot average over zero query rows".to_string()));
        }
        let m = functionals.len() as f64;
        Ok(functionals
            .iter()
            .fold(DVector::zeros(self.shape.n_columns()), |acc, a| acc + a)
            / m)
    }

    /// Interval of every coefficient, as two tensors.
    pub fn coef_interval(&self, alpha: f64) -> Result<Interval<CoefficientTensor>, DmlError> {
        let uncertainty = self.uncertainty()?;
        let p = self.shape.n_columns();
        let mut lower = DMatrix::zeros(self.shape.d_y, p);
        let mut upper = DMatrix::zeros(self.shape.d_y, p);
        for c in 0..p {
            let mut a = DVector::zeros(p);
            a[c] = 1.0;
            for i in 0..self.shape.d_y {
                let iv = uncertainty.linear_interval(&self.coef_matrix, i, &a, alpha)?;
                lower[(i, c)] = iv.lower;
                upper[(i, c)] = iv.upper;
            }
        }
        Ok(Interval {
            lower: CoefficientTensor::from_matrix(&lower, self.shape)?,
            upper: CoefficientTensor::from_matrix(&upper, self.shape)?,
        })
    }

    /// Final-stage weighted MSE on new data, averaged over outcomes.
    ///
    /// Nuisance predictions are the mean of the per-fold models' predictions.
    pub fn score(
        &self,
        y: &Matrix<f64>,
        t: &Matrix<f64>,
        x: Option<&Matrix<f64>>,
        w: Option<&Matrix<f64>>,
        sample_weight: Option<&[f64]>,
    ) -> Result<f64, DmlError> {
        let y = y.to_dmatrix("Y")?;
        let t = self.encoder.encode(&t.to_dmatrix("T")?)?;
        let n = y.nrows();
        if y.ncols() != self.shape.d_y || t.nrows() != n {
            return Err(DmlError::Configuration(format!(
                "score got Y of shape ({}, {}) and T with {} rows, expected {} outcome columns",
                n,
                y.ncols(),
                t.nrows(),
                self.shape.d_y
            )));
        }
        validate_sample_weight(sample_weight, n)?;
        let x_mat = match present(x) {
            Some(x) => x.to_dmatrix("X")?,
            None => DMatrix::zeros(n, 0),
        };
        let w_mat = match present(w) {
            Some(w) => w.to_dmatrix("W")?,
            None => DMatrix::zeros(n, 0),
        };
        if x_mat.shape() != (n, self.d_x) || w_mat.shape() != (n, self.d_w) {
            return Err(DmlError::Configuration(format!(
                "score got X of shape {:?} and W of shape {:?}, expected ({n}, {}) and ({n}, {})",
                x_mat.shape(),
                w_mat.shape(),
                self.d_x,
                self.d_w
            )));
        }
        let features = hstack(n, &[&x_mat, &w_mat]);

        let y_hat = mean_prediction(&self.models_y, &features, "model_y", y.shape())?;
        let t_hat = mean_prediction(&self.models_t, &features, "model_t", t.shape())?;
        let y_res = y - y_hat;
        let t_res = t - t_hat;

        let phi = match &self.featurizer {
            Some(f) => f.transform(&x_mat)?,
            None => DMatrix::from_element(n, 1, 1.0),
        };
        let design = cross_product_design(&t_res, &phi)?;
        let pred = self.final_model.predict(&design)?;
        Ok(final_score(&(y_res - pred), sample_weight))
    }
}

fn mean_prediction<N: NuisanceModel>(
    models: &[N],
    features: &DMatrix<f64>,
    name: &str,
    expected: (usize, usize),
) -> Result<DMatrix<f64>, DmlError> {
    if models.is_empty() {
        return Err(DmlError::NotFitted);
    }
    let mut total = DMatrix::zeros(expected.0, expected.1);
    for m in models {
        let p = m.predict(features)?;
        if p.shape() != expected {
            return Err(DmlError::NuisanceShape {
                model: name.to_string(),
                expected_rows: expected.0,
                expected_cols: expected.1,
                rows: p.nrows(),
                cols: p.ncols(),
            });
        }
        total += p;
    }
    Ok(total / models.len() as f64)
}

/// Weighted MSE of final-stage residuals averaged over outcome columns.
pub(crate) fn final_score(residuals: &DMatrix<f64>, sample_weight: Option<&[f64]>) -> f64 {
    let cols = residuals.ncols().max(1);
    residuals
        .column_iter()
        .map(|c| weighted_mse(c.iter(), sample_weight))
        .sum::<f64>()
        / cols as f64
}
