//! Nuisance
//!
//! Contracts for the auxiliary models that estimate `E[Y | X, W]` and
//! `E[T | X, W]`, the adapters that turn single-output learners and
//! classifiers into the multi-column contract the cross-fitting engine uses,
//! and a couple of built-in learners.
use crate::errors::DmlError;
use crate::featurizer::Featurizer;
use nalgebra::{DMatrix, DVector};

pub mod linear;
pub mod logistic;

pub use linear::LinearRegression;
pub use logistic::LogisticRegression;

/// Single-output regression learner.
pub trait Regressor: Send + Sync {
    fn fit(&mut self, x: &DMatrix<f64>, y: &DVector<f64>, sample_weight: Option<&[f64]>) -> Result<(), DmlError>;
    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, DmlError>;
    /// Non-fatal numerical warnings from the last fit.
    fn diagnostics(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Classification learner over labels `0..n_classes`.
pub trait Classifier: Send + Sync {
    fn fit(
        &mut self,
        x: &DMatrix<f64>,
        labels: &[usize],
        n_classes: usize,
        sample_weight: Option<&[f64]>,
    ) -> Result<(), DmlError>;
    /// Class probabilities, one row per sample and one column per class.
    fn predict_proba(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError>;
    fn diagnostics(&self) -> Vec<String> {
        Vec::new()
    }
}

/// The capability the cross-fitting engine needs from a nuisance model: fit a
/// (possibly multi-column) target and predict its conditional expectation.
///
/// The engine clones the prototype once per fold, so implementations must not
/// share fitted state between clones.
pub trait NuisanceModel: Send + Sync {
    fn fit(&mut self, x: &DMatrix<f64>, target: &DMatrix<f64>, sample_weight: Option<&[f64]>) -> Result<(), DmlError>;
    /// Prediction with one row per row of `x` and one column per target column.
    fn predict(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError>;
    fn diagnostics(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Fans a multi-column target out to one independent clone of a single-output
/// regressor per column.
#[derive(Debug, Clone)]
pub struct MultiOutputRegressor<R> {
    prototype: R,
    estimators: Vec<R>,
}

impl<R: Regressor + Clone> MultiOutputRegressor<R> {
    pub fn new(prototype: R) -> Self {
        MultiOutputRegressor {
            prototype,
            estimators: Vec::new(),
        }
    }

    /// Fitted per-column estimators.
    pub fn estimators(&self) -> &[R] {
        &self.estimators
    }
}

impl<R: Regressor + Clone> NuisanceModel for MultiOutputRegressor<R> {
    fn fit(&mut self, x: &DMatrix<f64>, target: &DMatrix<f64>, sample_weight: Option<&[f64]>) -> Result<(), DmlError> {
        let mut estimators = Vec::with_capacity(target.ncols());
        for j in 0..target.ncols() {
            let mut est = self.prototype.clone();
            est.fit(x, &target.column(j).into_owned(), sample_weight)?;
            estimators.push(est);
        }
        self.estimators = estimators;
        Ok(())
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        if self.estimators.is_empty() {
            return Err(DmlError::NotFitted);
        }
        let mut out = DMatrix::zeros(x.nrows(), self.estimators.len());
        for (j, est) in self.estimators.iter().enumerate() {
            let col = est.predict(x)?;
            if col.len() != x.nrows() {
                return Err(DmlError::NuisanceShape {
                    model: format!("output {j}"),
                    expected_rows: x.nrows(),
                    expected_cols: 1,
                    rows: col.len(),
                    cols: 1,
                });
            }
            out.set_column(j, &col);
        }
        Ok(out)
    }

    fn diagnostics(&self) -> Vec<String> {
        self.estimators.iter().flat_map(|e| e.diagnostics()).collect()
    }
}

/// Turns a classifier into a nuisance model for a categorical treatment.
///
/// The target is the drop-first one-hot encoding of the category (all zeros
/// for the baseline); `predict` returns the probabilities of the non-baseline
/// categories, which is the conditional expectation of that encoding.
#[derive(Debug, Clone)]
pub struct ProbabilityExpectation<C> {
    classifier: C,
    n_classes: Option<usize>,
}

impl<C: Classifier + Clone> ProbabilityExpectation<C> {
    pub fn new(classifier: C) -> Self {
        ProbabilityExpectation {
            classifier,
            n_classes: None,
        }
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }
}

fn labels_from_one_hot(target: &DMatrix<f64>) -> Result<Vec<usize>, DmlError> {
    let mut labels = Vec::with_capacity(target.nrows());
    for (i, row) in target.row_iter().enumerate() {
        let mut label = 0;
        for (j, &v) in row.iter().enumerate() {
            if v == 1.0 && label == 0 {
                label = j + 1;
            } else if v != 0.0 {
                return Err(DmlError::Configuration(format!(
                    "row {i} of a categorical treatment target is not a drop-first one-hot encoding"
                )));
            }
        }
        labels.push(label);
    }
    Ok(labels)
}

impl<C: Classifier + Clone> NuisanceModel for ProbabilityExpectation<C> {
    fn fit(&mut self, x: &DMatrix<f64>, target: &DMatrix<f64>, sample_weight: Option<&[f64]>) -> Result<(), DmlError> {
        let labels = labels_from_one_hot(target)?;
        let n_classes = target.ncols() + 1;
        self.classifier.fit(x, &labels, n_classes, sample_weight)?;
        self.n_classes = Some(n_classes);
        Ok(())
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        let n_classes = self.n_classes.ok_or(DmlError::NotFitted)?;
        let proba = self.classifier.predict_proba(x)?;
        if proba.ncols() != n_classes || proba.nrows() != x.nrows() {
            return Err(DmlError::NuisanceShape {
                model: "classifier probabilities".to_string(),
                expected_rows: x.nrows(),
                expected_cols: n_classes,
                rows: proba.nrows(),
                cols: proba.ncols(),
            });
        }
        Ok(proba.columns(1, n_classes - 1).into_owned())
    }

    fn diagnostics(&self) -> Vec<String> {
        self.classifier.diagnostics()
    }
}

/// Expands the nuisance inputs with a featurizer before handing them to a model.
#[derive(Debug, Clone)]
pub struct FeaturizedModel<F, M> {
    featurizer: F,
    model: M,
}

impl<F: Featurizer + Clone, M: NuisanceModel + Clone> FeaturizedModel<F, M> {
    pub fn new(featurizer: F, model: M) -> Self {
        FeaturizedModel { featurizer, model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<F: Featurizer + Clone, M: NuisanceModel + Clone> NuisanceModel for FeaturizedModel<F, M> {
    fn fit(&mut self, x: &DMatrix<f64>, target: &DMatrix<f64>, sample_weight: Option<&[f64]>) -> Result<(), DmlError> {
        let phi = self.featurizer.fit_transform(x)?;
        self.model.fit(&phi, target, sample_weight)
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        let phi = self.featurizer.transform(x)?;
        self.model.predict(&phi)
    }

    fn diagnostics(&self) -> Vec<String> {
        self.model.diagnostics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::featurizer::PolynomialFeatures;

    #[test]
    fn test_multi_output_fans_out_columns() {
        // y0 = 1 + 2x, y1 = -x
        let x = DMatrix::from_row_slice(4, 1, &[0.0, 1.0, 2.0, 3.0]);
        let y = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 3.0, -1.0, 5.0, -2.0, 7.0, -3.0]);
        let mut m = MultiOutputRegressor::new(LinearRegression::default());
        m.fit(&x, &y, None).unwrap();
        assert_eq!(m.estimators().len(), 2);
        let p = m.predict(&DMatrix::from_row_slice(1, 1, &[10.0])).unwrap();
        assert!((p[(0, 0)] - 21.0).abs() < 1e-9);
        assert!((p[(0, 1)] + 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_multi_output_requires_fit() {
        let m = MultiOutputRegressor::new(LinearRegression::default());
        let x = DMatrix::from_row_slice(1, 1, &[1.0]);
        assert!(matches!(m.predict(&x), Err(DmlError::NotFitted)));
    }

    #[test]
    fn test_probability_expectation_drops_baseline() {
        let x = DMatrix::from_row_slice(6, 1, &[-2.0, -1.0, -0.5, 0.5, 1.0, 2.0]);
        let target = DMatrix::from_row_slice(6, 1, &[0.0, 0.0, 1.0, 0.0, 1.0, 1.0]);
        let mut m = ProbabilityExpectation::new(LogisticRegression::default());
        m.fit(&x, &target, None).unwrap();
        let p = m.predict(&x).unwrap();
        assert_eq!(p.shape(), (6, 1));
        assert!(p.iter().all(|v| *v > 0.0 && *v < 1.0));
        assert!(p[(5, 0)] > p[(0, 0)]);
    }

    #[test]
    fn test_probability_expectation_rejects_bad_encoding() {
        let x = DMatrix::from_row_slice(2, 1, &[0.0, 1.0]);
        let target = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 0.0]);
        let mut m = ProbabilityExpectation::new(LogisticRegression::default());
        assert!(matches!(m.fit(&x, &target, None), Err(DmlError::Configuration(_))));
    }

    #[test]
    fn test_featurized_model_fits_quadratic() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64 / 3.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 1.0 - x + 0.5 * x * x).collect();
        let x = DMatrix::from_column_slice(10, 1, &xs);
        let y = DMatrix::from_column_slice(10, 1, &ys);
        let mut m = FeaturizedModel::new(
            PolynomialFeatures::new(2, false),
            MultiOutputRegressor::new(LinearRegression::default()),
        );
        m.fit(&x, &y, None).unwrap();
        let p = m.predict(&x).unwrap();
        for i in 0..10 {
            assert!((p[(i, 0)] - ys[i]).abs() < 1e-8);
        }
    }
}
