//! Errors
//!
//! Custom error types used throughout the `orthoml` crate.
use thiserror::Error;

/// Errors that can occur while fitting or querying a DML estimator.
#[derive(Debug, Error)]
pub enum DmlError {
    /// Bad fold count, mismatched row counts, non-finite input and similar.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A nuisance prediction does not have the shape of its target.
    #[error(
        "Nuisance model `{model}` returned a prediction of shape ({rows}, {cols}), expected ({expected_rows}, {expected_cols})."
    )]
    NuisanceShape {
        model: String,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },
    /// A nuisance model failed to fit, or produced no usable prediction.
    #[error("Nuisance model `{model}` failed: {reason}")]
    NuisanceFit { model: String, reason: String },
    /// Unregularized final stage on a rank-deficient design.
    #[error("Final stage design has rank {rank} but {cols} columns, ordinary least squares needs full column rank.")]
    DesignRank { rank: usize, cols: usize },
    /// Interval requested but the fitted final stage cannot provide one.
    #[error("Intervals are not available: {0}")]
    IntervalUnsupported(String),
    /// Query issued before a successful fit.
    #[error("The estimator has not been fitted yet, call `fit` first.")]
    NotFitted,
    /// First value is the name of the parameter, second is expected, third is what was passed.
    #[error("Invalid parameter value passed for {0}, expected {1} but {2} provided.")]
    InvalidParameter(String, String, String),
    /// Unable to write to file.
    #[error("Unable to write to file: {0}")]
    UnableToWrite(String),
    /// Unable to read from file.
    #[error("Unable to read from a file {0}")]
    UnableToRead(String),
}
