//! Featurizer
//!
//! Deterministic expansions of the heterogeneity covariates X into the basis
//! Φ(X) used by the final stage. The expansion is fitted once on the full
//! sample, never per fold.
use crate::errors::DmlError;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

pub trait Featurizer: Send + Sync {
    /// Learn whatever the transform needs from `x` and return Φ(x).
    fn fit_transform(&mut self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError>;
    /// Apply a fitted transform.
    fn transform(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError>;
    /// Number of output columns, `None` before fitting.
    fn n_output_features(&self) -> Option<usize>;
    /// Names of the output columns given names of the input columns.
    fn feature_names(&self, input_names: &[String]) -> Result<Vec<String>, DmlError>;
}

/// Polynomial basis of total degree at most `degree`.
///
/// Terms are ordered by degree, and inside a degree lexicographically over the
/// combinations (with replacement) of input columns, e.g. for two inputs and
/// degree 2: `1, x0, x1, x0^2, x0 x1, x1^2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolynomialFeatures {
    pub degree: usize,
    pub include_bias: bool,
    n_input_features: Option<usize>,
    // Each term is the multiset of input columns that are multiplied together.
    terms: Vec<Vec<usize>>,
}

impl Default for PolynomialFeatures {
    fn default() -> Self {
        PolynomialFeatures::new(1, true)
    }
}

impl PolynomialFeatures {
    pub fn new(degree: usize, include_bias: bool) -> Self {
        PolynomialFeatures {
            degree,
            include_bias,
            n_input_features: None,
            terms: Vec::new(),
        }
    }

    fn build_terms(&self, n_inputs: usize) -> Vec<Vec<usize>> {
        let mut terms = Vec::new();
        let start = if self.include_bias { 0 } else { 1 };
        for d in start..=self.degree {
            let mut current = Vec::with_capacity(d);
            push_combinations(n_inputs, d, 0, &mut current, &mut terms);
        }
        terms
    }

    fn apply(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(x.nrows(), self.terms.len(), |i, t| {
            self.terms[t].iter().map(|&c| x[(i, c)]).product()
        })
    }
}

fn push_combinations(n: usize, remaining: usize, from: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    if remaining == 0 {
        out.push(current.clone());
        return;
    }
    for c in from..n {
        current.push(c);
        push_combinations(n, remaining - 1, c, current, out);
        current.pop();
    }
}

impl Featurizer for PolynomialFeatures {
    fn fit_transform(&mut self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        let terms = self.build_terms(x.ncols());
        if terms.is_empty() {
            return Err(DmlError::Configuration(format!(
                "polynomial features of degree {} without bias produce no columns",
                self.degree
            )));
        }
        self.terms = terms;
        self.n_input_features = Some(x.ncols());
        Ok(self.apply(x))
    }

    fn transform(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        let n_inputs = self.n_input_features.ok_or(DmlError::NotFitted)?;
        if x.ncols() != n_inputs {
            return Err(DmlError::Configuration(format!(
                "featurizer was fitted on {n_inputs} columns, {} provided",
                x.ncols()
            )));
        }
        Ok(self.apply(x))
    }

    fn n_output_features(&self) -> Option<usize> {
        self.n_input_features.map(|_| self.terms.len())
    }

    fn feature_names(&self, input_names: &[String]) -> Result<Vec<String>, DmlError> {
        let n_inputs = self.n_input_features.ok_or(DmlError::NotFitted)?;
        if input_names.len() != n_inputs {
            return Err(DmlError::Configuration(format!(
                "{} input names given for {n_inputs} columns",
                input_names.len()
            )));
        }
        Ok(self
            .terms
            .iter()
            .map(|term| {
                if term.is_empty() {
                    return "1".to_string();
                }
                let mut parts: Vec<String> = Vec::new();
                let mut i = 0;
                while i < term.len() {
                    let c = term[i];
                    let power = term[i..].iter().take_while(|&&t| t == c).count();
                    if power == 1 {
                        parts.push(input_names[c].clone());
                    } else {
                        parts.push(format!("{}^{}", input_names[c], power));
                    }
                    i += power;
                }
                parts.join(" ")
            })
            .collect())
    }
}

/// Default input names `x0, x1, ...`.
pub fn default_input_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("x{i}")).collect()
}
