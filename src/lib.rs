// Modules
pub mod config;
pub mod data;
pub mod dml;
pub mod errors;
pub mod featurizer;
pub mod final_stage;
pub mod folds;
pub mod inference;
pub mod nuisance;
pub mod residualizer;
pub mod utils;

// Individual classes, and functions
pub use config::{DmlConfig, JsonIO};
pub use data::Matrix;
pub use dml::{DmlEstimator, FitDiagnostics, FittedDml, LinearDml};
pub use errors::DmlError;
pub use featurizer::{Featurizer, PolynomialFeatures};
pub use final_stage::{CoefficientTensor, CovType, FinalModel, FinalRegression, Regularizer};
pub use folds::{FoldAssignment, FoldSplitter, KFold, StratifiedKFold};
pub use inference::{Inference, Interval};
pub use nuisance::{
    Classifier, FeaturizedModel, LinearRegression, LogisticRegression, MultiOutputRegressor, NuisanceModel,
    ProbabilityExpectation, Regressor,
};
