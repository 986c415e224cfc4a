//! Residualizer
//!
//! The cross-fitting engine. For every fold it fits fresh clones of the outcome
//! and treatment nuisance models on the other folds, predicts the held-out
//! rows and stores `Y - Ŷ` and `T - T̂`. Folds are independent and run in
//! parallel; each one returns its own predictions, which are scattered into
//! disjoint rows once all folds have joined.
use crate::data::{take_rows, take_weights};
use crate::errors::DmlError;
use crate::folds::FoldAssignment;
use crate::nuisance::NuisanceModel;
use crate::utils::weighted_mse;
use log::debug;
use nalgebra::DMatrix;
use rayon::prelude::*;

/// A non-fatal warning raised by a nuisance model while fitting one fold.
#[derive(Debug, Clone, PartialEq)]
pub struct NuisanceWarning {
    pub fold: usize,
    pub model: &'static str,
    pub message: String,
}

/// Everything the cross-fitting pass produces.
#[derive(Debug, Clone)]
pub struct CrossFitResult<MY, MT> {
    pub y_residuals: DMatrix<f64>,
    pub t_residuals: DMatrix<f64>,
    /// Outcome models, indexed by fold.
    pub models_y: Vec<MY>,
    /// Treatment models, indexed by fold.
    pub models_t: Vec<MT>,
    /// Held-out weighted MSE of the outcome model per fold, averaged over outcome columns.
    pub nuisance_scores_y: Vec<f64>,
    /// Held-out weighted MSE of the treatment model per fold, averaged over treatment columns.
    pub nuisance_scores_t: Vec<f64>,
    pub warnings: Vec<NuisanceWarning>,
}

struct FoldOutput<MY, MT> {
    test: Vec<usize>,
    y_pred: DMatrix<f64>,
    t_pred: DMatrix<f64>,
    model_y: MY,
    model_t: MT,
}

fn check_prediction(
    pred: &DMatrix<f64>,
    model: &str,
    expected_rows: usize,
    expected_cols: usize,
) -> Result<(), DmlError> {
    if pred.shape() != (expected_rows, expected_cols) {
        return Err(DmlError::NuisanceShape {
            model: model.to_string(),
            expected_rows,
            expected_cols,
            rows: pred.nrows(),
            cols: pred.ncols(),
        });
    }
    if pred.iter().any(|v| !v.is_finite()) {
        return Err(DmlError::NuisanceFit {
            model: model.to_string(),
            reason: "prediction contains non-finite values".to_string(),
        });
    }
    Ok(())
}

fn fit_fold<MY, MT>(
    k: usize,
    model_y: &MY,
    model_t: &MT,
    folds: &FoldAssignment,
    features: &DMatrix<f64>,
    y: &DMatrix<f64>,
    t: &DMatrix<f64>,
    sample_weight: Option<&[f64]>,
) -> Result<FoldOutput<MY, MT>, DmlError>
where
    MY: NuisanceModel + Clone,
    MT: NuisanceModel + Clone,
{
    let train = folds.train_indices(k);
    let test = folds.test_indices(k);
    let x_train = take_rows(features, &train);
    let x_test = take_rows(features, &test);
    let w_train = take_weights(sample_weight, &train);

    let mut fold_y = model_y.clone();
    fold_y
        .fit(&x_train, &take_rows(y, &train), w_train.as_deref())
        .map_err(|e| annotate(e, "model_y", k))?;
    let mut fold_t = model_t.clone();
    fold_t
        .fit(&x_train, &take_rows(t, &train), w_train.as_deref())
        .map_err(|e| annotate(e, "model_t", k))?;

    let y_pred = fold_y.predict(&x_test).map_err(|e| annotate(e, "model_y", k))?;
    check_prediction(&y_pred, "model_y", test.len(), y.ncols())?;
    let t_pred = fold_t.predict(&x_test).map_err(|e| annotate(e, "model_t", k))?;
    check_prediction(&t_pred, "model_t", test.len(), t.ncols())?;

    debug!("Fitted nuisance models for fold {} ({} train rows, {} held out).", k, train.len(), test.len());
    Ok(FoldOutput {
        test,
        y_pred,
        t_pred,
        model_y: fold_y,
        model_t: fold_t,
    })
}

// Learner errors are reported against the model and fold that raised them;
// errors that already name a model pass through unchanged.
fn annotate(e: DmlError, model: &str, fold: usize) -> DmlError {
    match e {
        DmlError::NuisanceShape { .. } | DmlError::NuisanceFit { .. } => e,
        other => DmlError::NuisanceFit {
            model: format!("{model} (fold {fold})"),
            reason: other.to_string(),
        },
    }
}

/// Cross-fit the nuisance models and return out-of-fold residuals.
///
/// * `features` - Nuisance inputs `[X | W]`, possibly with zero columns.
/// * `y` - Outcomes, n × d_y.
/// * `t` - (Encoded) treatments, n × d_t.
///
/// Any fold failure aborts the whole pass; no partial result is returned.
#[allow(clippy::too_many_arguments)]
pub fn crossfit<MY, MT>(
    model_y: &MY,
    model_t: &MT,
    folds: &FoldAssignment,
    features: &DMatrix<f64>,
    y: &DMatrix<f64>,
    t: &DMatrix<f64>,
    sample_weight: Option<&[f64]>,
) -> Result<CrossFitResult<MY, MT>, DmlError>
where
    MY: NuisanceModel + Clone,
    MT: NuisanceModel + Clone,
{
    let n = y.nrows();
    if folds.n_rows() != n || features.nrows() != n || t.nrows() != n {
        return Err(DmlError::Configuration(format!(
            "cross-fitting inputs disagree on row count: folds {}, features {}, Y {}, T {}",
            folds.n_rows(),
            features.nrows(),
            n,
            t.nrows()
        )));
    }

    let outputs: Vec<FoldOutput<MY, MT>> = (0..folds.n_folds())
        .into_par_iter()
        .map(|k| fit_fold(k, model_y, model_t, folds, features, y, t, sample_weight))
        .collect::<Result<Vec<_>, DmlError>>()?;

    let mut y_residuals = DMatrix::zeros(n, y.ncols());
    let mut t_residuals = DMatrix::zeros(n, t.ncols());
    let mut written = vec![false; n];
    let mut models_y = Vec::with_capacity(outputs.len());
    let mut models_t = Vec::with_capacity(outputs.len());
    let mut nuisance_scores_y = Vec::with_capacity(outputs.len());
    let mut nuisance_scores_t = Vec::with_capacity(outputs.len());
    let mut warnings = Vec::new();

    for (k, out) in outputs.into_iter().enumerate() {
        for (r, &row) in out.test.iter().enumerate() {
            if written[row] {
                return Err(DmlError::Configuration(format!("row {row} is held out by more than one fold")));
            }
            written[row] = true;
            for j in 0..y.ncols() {
                y_residuals[(row, j)] = y[(row, j)] - out.y_pred[(r, j)];
            }
            for j in 0..t.ncols() {
                t_residuals[(row, j)] = t[(row, j)] - out.t_pred[(r, j)];
            }
        }
        let w_test = take_weights(sample_weight, &out.test);
        nuisance_scores_y.push(held_out_score(&y_residuals, &out.test, w_test.as_deref()));
        nuisance_scores_t.push(held_out_score(&t_residuals, &out.test, w_test.as_deref()));

        for message in out.model_y.diagnostics() {
            warnings.push(NuisanceWarning { fold: k, model: "model_y", message });
        }
        for message in out.model_t.diagnostics() {
            warnings.push(NuisanceWarning { fold: k, model: "model_t", message });
        }
        models_y.push(out.model_y);
        models_t.push(out.model_t);
    }

    if let Some(row) = written.iter().position(|w| !w) {
        return Err(DmlError::Configuration(format!("row {row} was not held out by any fold")));
    }

    Ok(CrossFitResult {
        y_residuals,
        t_residuals,
        models_y,
        models_t,
        nuisance_scores_y,
        nuisance_scores_t,
        warnings,
    })
}

fn held_out_score(residuals: &DMatrix<f64>, rows: &[usize], sample_weight: Option<&[f64]>) -> f64 {
    let held_out = take_rows(residuals, rows);
    let cols = held_out.ncols();
    (0..cols)
        .map(|j| weighted_mse(held_out.column(j).iter(), sample_weight))
        .sum::<f64>()
        / cols as f64
}
