//! L2-penalised logistic regression fitted by Newton's method (IRLS).
//!
//! Two classes are handled by a single binary model; more classes use one
//! binary model per class (one-vs-rest) with probabilities normalised per row.
use crate::errors::DmlError;
use crate::nuisance::Classifier;
use crate::utils::validate_positive_float_parameter;
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone)]
pub struct LogisticRegression {
    /// Penalty on `‖coef‖²/2`, the intercept is not penalised.
    pub l2_penalty: f64,
    pub max_iter: usize,
    pub tol: f64,
    n_classes: usize,
    n_features: usize,
    // One coefficient vector (intercept first) per binary model.
    coefs: Vec<DVector<f64>>,
    warnings: Vec<String>,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        LogisticRegression::new(1.0, 100, 1e-8)
    }
}

fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}

fn with_intercept(x: &DMatrix<f64>) -> DMatrix<f64> {
    let (n, p) = x.shape();
    DMatrix::from_fn(n, p + 1, |i, j| if j == 0 { 1.0 } else { x[(i, j - 1)] })
}

impl LogisticRegression {
    pub fn new(l2_penalty: f64, max_iter: usize, tol: f64) -> Self {
        LogisticRegression {
            l2_penalty,
            max_iter,
            tol,
            n_classes: 0,
            n_features: 0,
            coefs: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Fitted coefficient vectors, intercept first.
    pub fn coefs(&self) -> &[DVector<f64>] {
        &self.coefs
    }

    // Returns the coefficients and whether Newton's method converged.
    fn fit_binary(&self, xa: &DMatrix<f64>, y: &[f64], w: &[f64]) -> Result<(DVector<f64>, bool), DmlError> {
        let (n, q) = xa.shape();
        let mut beta = DVector::zeros(q);
        for _ in 0..self.max_iter {
            let eta = xa * &beta;
            let mut grad = DVector::zeros(q);
            let mut hess = DMatrix::zeros(q, q);
            for i in 0..n {
                let mu = sigmoid(eta[i]);
                let r = w[i] * (mu - y[i]);
                let h = w[i] * mu * (1.0 - mu);
                let row = xa.row(i);
                for a in 0..q {
                    grad[a] += r * row[a];
                    for b in 0..=a {
                        hess[(a, b)] += h * row[a] * row[b];
                    }
                }
            }
            for a in 0..q {
                for b in 0..a {
                    hess[(b, a)] = hess[(a, b)];
                }
            }
            for a in 1..q {
                grad[a] += self.l2_penalty * beta[a];
                hess[(a, a)] += self.l2_penalty;
            }
            // Keeps the system solvable when a class is (nearly) separable.
            for a in 0..q {
                hess[(a, a)] += 1e-10;
            }
            let step = match hess.clone().cholesky() {
                Some(chol) => chol.solve(&grad),
                None => hess.lu().solve(&grad).ok_or_else(|| DmlError::NuisanceFit {
                    model: "LogisticRegression".to_string(),
                    reason: "singular Hessian".to_string(),
                })?,
            };
            beta -= &step;
            if step.amax() < self.tol {
                return Ok((beta, true));
            }
        }
        Ok((beta, false))
    }
}

impl Classifier for LogisticRegression {
    fn fit(
        &mut self,
        x: &DMatrix<f64>,
        labels: &[usize],
        n_classes: usize,
        sample_weight: Option<&[f64]>,
    ) -> Result<(), DmlError> {
        validate_positive_float_parameter(self.l2_penalty, "l2_penalty")?;
        let n = x.nrows();
        if labels.len() != n {
            return Err(DmlError::Configuration(format!(
                "logistic regression got {n} feature rows and {} labels",
                labels.len()
            )));
        }
        if n_classes < 2 {
            return Err(DmlError::Configuration("logistic regression needs at least two classes".to_string()));
        }
        if let Some(l) = labels.iter().find(|&&l| l >= n_classes) {
            return Err(DmlError::Configuration(format!("label {l} is out of range for {n_classes} classes")));
        }
        let w: Vec<f64> = match sample_weight {
            Some(w) => w.to_vec(),
            None => vec![1.0; n],
        };
        let xa = with_intercept(x);
        let targets: Vec<usize> = if n_classes == 2 { vec![1] } else { (0..n_classes).collect() };

        let mut coefs = Vec::with_capacity(targets.len());
        let mut warnings = Vec::new();
        for c in targets {
            let y: Vec<f64> = labels.iter().map(|&l| if l == c { 1.0 } else { 0.0 }).collect();
            let (beta, converged) = self.fit_binary(&xa, &y, &w)?;
            if !converged {
                let msg = format!(
                    "logistic regression for class {c} did not converge in {} iterations",
                    self.max_iter
                );
                warnings.push(msg);
            }
            coefs.push(beta);
        }
        self.coefs = coefs;
        self.warnings = warnings;
        self.n_classes = n_classes;
        self.n_features = x.ncols();
        Ok(())
    }

    fn predict_proba(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        if self.coefs.is_empty() {
            return Err(DmlError::NotFitted);
        }
        if x.ncols() != self.n_features {
            return Err(DmlError::Configuration(format!(
                "logistic regression was fitted on {} columns, {} provided",
                self.n_features,
                x.ncols()
            )));
        }
        let xa = with_intercept(x);
        let n = x.nrows();
        let mut proba = DMatrix::zeros(n, self.n_classes);
        if self.n_classes == 2 {
            let eta = &xa * &self.coefs[0];
            for i in 0..n {
                let p = sigmoid(eta[i]);
                proba[(i, 0)] = 1.0 - p;
                proba[(i, 1)] = p;
            }
        } else {
            for (c, beta) in self.coefs.iter().enumerate() {
                let eta = &xa * beta;
                for i in 0..n {
                    proba[(i, c)] = sigmoid(eta[i]);
                }
            }
            for i in 0..n {
                let total: f64 = proba.row(i).sum();
                for c in 0..self.n_classes {
                    proba[(i, c)] /= total;
                }
            }
        }
        Ok(proba)
    }

    fn diagnostics(&self) -> Vec<String> {
        self.warnings.clone()
    }
}
