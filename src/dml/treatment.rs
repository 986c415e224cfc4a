//! Treatment encoding.
//!
//! Continuous treatments pass through unchanged. A categorical treatment is a
//! single column of category values; the sorted distinct values seen at fit
//! time are the categories, the first one is the baseline, and every row is
//! encoded as the drop-first one-hot vector of its category.
use crate::errors::DmlError;
use nalgebra::DMatrix;

#[derive(Debug, Clone, PartialEq)]
pub enum TreatmentEncoder {
    Continuous { d_t: usize },
    Discrete { categories: Vec<f64> },
}

impl TreatmentEncoder {
    pub fn fit(t: &DMatrix<f64>, discrete: bool) -> Result<Self, DmlError> {
        if t.ncols() == 0 {
            return Err(DmlError::Configuration("the treatment needs at least one column".to_string()));
        }
        if !discrete {
            return Ok(TreatmentEncoder::Continuous { d_t: t.ncols() });
        }
        if t.ncols() != 1 {
            return Err(DmlError::Configuration(format!(
                "a discrete treatment must be a single column of categories, got {} columns",
                t.ncols()
            )));
        }
        let mut categories: Vec<f64> = t.iter().copied().collect();
        categories.sort_by(|a, b| a.total_cmp(b));
        categories.dedup();
        if categories.len() < 2 {
            return Err(DmlError::Configuration(
                "a discrete treatment needs at least two categories".to_string(),
            ));
        }
        Ok(TreatmentEncoder::Discrete { categories })
    }

    /// Number of encoded treatment columns.
    pub fn d_t(&self) -> usize {
        match self {
            TreatmentEncoder::Continuous { d_t } => *d_t,
            TreatmentEncoder::Discrete { categories } => categories.len() - 1,
        }
    }

    pub fn categories(&self) -> Option<&[f64]> {
        match self {
            TreatmentEncoder::Continuous { .. } => None,
            TreatmentEncoder::Discrete { categories } => Some(categories),
        }
    }

    /// Category index of every row, `None` for a continuous treatment.
    pub fn labels(&self, t: &DMatrix<f64>) -> Result<Option<Vec<usize>>, DmlError> {
        match self {
            TreatmentEncoder::Continuous { .. } => Ok(None),
            TreatmentEncoder::Discrete { categories } => {
                if t.ncols() != 1 {
                    return Err(DmlError::Configuration(format!(
                        "a discrete treatment must be a single column of categories, got {} columns",
                        t.ncols()
                    )));
                }
                t.iter()
                    .map(|v| {
                        categories
                            .binary_search_by(|c| c.total_cmp(v))
                            .map_err(|_| DmlError::Configuration(format!("unknown treatment category {v}")))
                    })
                    .collect::<Result<Vec<usize>, DmlError>>()
                    .map(Some)
            }
        }
    }

    /// The matrix the nuisance and final stages work with.
    pub fn encode(&self, t: &DMatrix<f64>) -> Result<DMatrix<f64>, DmlError> {
        match self {
            TreatmentEncoder::Continuous { d_t } => {
                if t.ncols() != *d_t {
                    return Err(DmlError::Configuration(format!(
                        "the estimator was fitted with {d_t} treatment columns, {} provided",
                        t.ncols()
                    )));
                }
                Ok(t.clone())
            }
            TreatmentEncoder::Discrete { .. } => {
                let labels = self.labels(t)?.unwrap_or_default();
                let d_t = self.d_t();
                Ok(DMatrix::from_fn(t.nrows(), d_t, |i, j| if labels[i] == j + 1 { 1.0 } else { 0.0 }))
            }
        }
    }
}
