//! Estimator Configuration
//!
//! Defines the configuration of the cross-fitted DML estimator: fold count,
//! fold shuffling, treatment type, inference mode and threading, together with
//! the JSON persistence helpers shared by the serialisable types of the crate.
use crate::errors::DmlError;
use crate::inference::Inference;
use crate::utils::validate_min_usize_parameter;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_n_folds() -> usize {
    2
}
fn default_shuffle() -> bool {
    true
}
fn default_seed() -> u64 {
    0
}

/// Configuration for the `DmlEstimator`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DmlConfig {
    /// Number of cross-fitting folds, at least 2.
    #[serde(default = "default_n_folds")]
    pub n_folds: usize,
    /// Shuffle rows before assigning folds.
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    /// Seed for fold shuffling and bootstrap resampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Treat the (single) treatment column as categorical.
    #[serde(default)]
    pub discrete_treatment: bool,
    /// How intervals are produced.
    #[serde(default)]
    pub inference: Inference,
    /// Number of threads for parallel tasks. Defaults to all available cores.
    #[serde(default)]
    pub num_threads: Option<usize>,
}

impl Default for DmlConfig {
    fn default() -> Self {
        DmlConfig {
            n_folds: default_n_folds(),
            shuffle: default_shuffle(),
            seed: default_seed(),
            discrete_treatment: false,
            inference: Inference::None,
            num_threads: None,
        }
    }
}

impl DmlConfig {
    /// Set the number of cross-fitting folds.
    /// * `n_folds` - Number of folds. Larger values (5 or 6) help on small samples
    ///   at a higher compute cost.
    pub fn set_n_folds(mut self, n_folds: usize) -> Self {
        self.n_folds = n_folds;
        self
    }

    /// Set whether rows are shuffled before assigning folds.
    pub fn set_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Set the seed used for shuffling and bootstrap draws.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set whether the treatment is categorical.
    pub fn set_discrete_treatment(mut self, discrete_treatment: bool) -> Self {
        self.discrete_treatment = discrete_treatment;
        self
    }

    /// Set the inference mode.
    pub fn set_inference(mut self, inference: Inference) -> Self {
        self.inference = inference;
        self
    }

    /// Set the number of threads.
    pub fn set_num_threads(mut self, num_threads: Option<usize>) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Check the parameters for consistency.
    pub fn validate(&self) -> Result<(), DmlError> {
        if self.n_folds < 2 {
            return Err(DmlError::Configuration(format!(
                "cross-fitting needs at least 2 folds, {} requested",
                self.n_folds
            )));
        }
        if let Some(t) = self.num_threads {
            validate_min_usize_parameter(t, 1, "num_threads")?;
        }
        if let Inference::Bootstrap { n_bootstrap_samples } = self.inference {
            validate_min_usize_parameter(n_bootstrap_samples, 2, "n_bootstrap_samples")?;
        }
        Ok(())
    }
}

/// JSON persistence.
pub trait JsonIO: Serialize + DeserializeOwned + Sized {
    /// Save as a json object to a file.
    ///
    /// * `path` - Path to save to.
    fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DmlError> {
        fs::write(path, self.json_dump()?).map_err(|e| DmlError::UnableToWrite(e.to_string()))
    }

    /// Dump as a json string.
    fn json_dump(&self) -> Result<String, DmlError> {
        serde_json::to_string(self).map_err(|e| DmlError::UnableToWrite(e.to_string()))
    }

    /// Load from a json string.
    ///
    /// * `json_str` - String object, which can be serialized to json.
    fn from_json(json_str: &str) -> Result<Self, DmlError> {
        serde_json::from_str::<Self>(json_str).map_err(|e| DmlError::UnableToRead(e.to_string()))
    }

    /// Load from a path to a json object.
    ///
    /// * `path` - Path to load from.
    fn load<P: AsRef<Path>>(path: P) -> Result<Self, DmlError> {
        let json_str = fs::read_to_string(path).map_err(|e| DmlError::UnableToRead(e.to_string()))?;
        Self::from_json(&json_str)
    }
}

impl JsonIO for DmlConfig {}
