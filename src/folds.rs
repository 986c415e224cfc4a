//! Folds
//!
//! Cross-fitting splitters. A splitter partitions the rows of a sample into K
//! disjoint, exhaustive folds whose sizes differ by at most one, so every row
//! is held out exactly once.
use crate::errors::DmlError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Fold label per row, produced once per fit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldAssignment {
    labels: Vec<usize>,
    n_folds: usize,
}

impl FoldAssignment {
    /// Build an assignment from explicit labels, every label must be below `n_folds`
    /// and every fold must be non-empty.
    pub fn from_labels(labels: Vec<usize>, n_folds: usize) -> Result<Self, DmlError> {
        check_fold_count(labels.len(), n_folds)?;
        let mut sizes = vec![0usize; n_folds];
        for &l in &labels {
            if l >= n_folds {
                return Err(DmlError::Configuration(format!(
                    "fold label {l} is out of range for {n_folds} folds"
                )));
            }
            sizes[l] += 1;
        }
        if let Some(k) = sizes.iter().position(|&s| s == 0) {
            return Err(DmlError::Configuration(format!("fold {k} is empty")));
        }
        Ok(FoldAssignment { labels, n_folds })
    }

    pub fn n_folds(&self) -> usize {
        self.n_folds
    }

    pub fn n_rows(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn fold_of(&self, row: usize) -> usize {
        self.labels[row]
    }

    /// Rows held out in fold `k`, ascending.
    pub fn test_indices(&self, k: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == k)
            .map(|(i, _)| i)
            .collect()
    }

    /// Rows used to train the models of fold `k`, ascending.
    pub fn train_indices(&self, k: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l != k)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.n_folds];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }
}

// A splitter assigns every row of a sample to exactly one held-out fold.
pub trait FoldSplitter: std::fmt::Debug + Send + Sync {
    /// Split `n` rows. `strata` optionally gives a class label per row that the
    /// splitter may use to balance folds.
    fn split(&self, n: usize, strata: Option<&[usize]>) -> Result<FoldAssignment, DmlError>;
}

fn check_fold_count(n: usize, n_folds: usize) -> Result<(), DmlError> {
    if n_folds < 2 {
        return Err(DmlError::Configuration(format!(
            "cross-fitting needs at least 2 folds, {n_folds} requested"
        )));
    }
    if n_folds > n {
        return Err(DmlError::Configuration(format!(
            "cannot split {n} rows into {n_folds} non-empty folds"
        )));
    }
    Ok(())
}

fn row_order(n: usize, shuffle: bool, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    if shuffle {
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }
    order
}

/// Fixed folds, reused as given for a sample of the same size.
impl FoldSplitter for FoldAssignment {
    fn split(&self, n: usize, _strata: Option<&[usize]>) -> Result<FoldAssignment, DmlError> {
        if n != self.labels.len() {
            return Err(DmlError::Configuration(format!(
                "fold assignment covers {} rows but {n} rows are being split",
                self.labels.len()
            )));
        }
        Ok(self.clone())
    }
}

/// Plain K-fold splitter: contiguous chunks of the (optionally shuffled) row
/// order, the first `n % K` folds get one extra row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KFold {
    pub n_folds: usize,
    pub shuffle: bool,
    pub seed: u64,
}

impl KFold {
    pub fn new(n_folds: usize, shuffle: bool, seed: u64) -> Self {
        KFold { n_folds, shuffle, seed }
    }
}

impl FoldSplitter for KFold {
    fn split(&self, n: usize, _strata: Option<&[usize]>) -> Result<FoldAssignment, DmlError> {
        check_fold_count(n, self.n_folds)?;
        let order = row_order(n, self.shuffle, self.seed);
        let base = n / self.n_folds;
        let extra = n % self.n_folds;
        let mut labels = vec![0usize; n];
        let mut pos = 0;
        for k in 0..self.n_folds {
            let size = base + usize::from(k < extra);
            for &row in &order[pos..pos + size] {
                labels[row] = k;
            }
            pos += size;
        }
        Ok(FoldAssignment {
            labels,
            n_folds: self.n_folds,
        })
    }
}

/// Stratified K-fold splitter: rows are grouped by stratum (keeping the
/// shuffled order inside each stratum) and dealt round-robin, so each stratum
/// is spread over all folds and fold sizes still differ by at most one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratifiedKFold {
    pub n_folds: usize,
    pub shuffle: bool,
    pub seed: u64,
}

impl StratifiedKFold {
    pub fn new(n_folds: usize, shuffle: bool, seed: u64) -> Self {
        StratifiedKFold { n_folds, shuffle, seed }
    }
}

impl FoldSplitter for StratifiedKFold {
    fn split(&self, n: usize, strata: Option<&[usize]>) -> Result<FoldAssignment, DmlError> {
        check_fold_count(n, self.n_folds)?;
        let mut order = row_order(n, self.shuffle, self.seed);
        if let Some(s) = strata {
            if s.len() != n {
                return Err(DmlError::Configuration(format!(
                    "strata has {} entries but {n} rows are being split",
                    s.len()
                )));
            }
            // sort_by_key is stable, the shuffled order survives inside each stratum.
            order.sort_by_key(|&row| s[row]);
        }
        let mut labels = vec![0usize; n];
        for (pos, &row) in order.iter().enumerate() {
            labels[row] = pos % self.n_folds;
        }
        Ok(FoldAssignment {
            labels,
            n_folds: self.n_folds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(folds: &FoldAssignment, n: usize) {
        let mut seen = vec![0usize; n];
        for k in 0..folds.n_folds() {
            let test = folds.test_indices(k);
            let train = folds.train_indices(k);
            assert_eq!(test.len() + train.len(), n);
            assert!(!test.is_empty());
            for &i in &test {
                seen[i] += 1;
                assert!(!train.contains(&i), "row {i} is both train and test in fold {k}");
            }
        }
        assert!(seen.iter().all(|&c| c == 1), "every row must be held out exactly once");
        let sizes = folds.sizes();
        let max = sizes.iter().max().unwrap();
        let min = sizes.iter().min().unwrap();
        assert!(max - min <= 1, "fold sizes {sizes:?} differ by more than one");
    }

    #[test]
    fn test_kfold_sizes() {
        let folds = KFold::new(2, true, 0).split(4, None).unwrap();
        assert_eq!(folds.sizes(), vec![2, 2]);

        let folds = KFold::new(2, true, 0).split(5, None).unwrap();
        let mut sizes = folds.sizes();
        sizes.sort();
        assert_eq!(sizes, vec![2, 3]);
    }

    #[test]
    fn test_kfold_partition_property() {
        for n_folds in 2..7 {
            for n in n_folds..40 {
                let folds = KFold::new(n_folds, true, n as u64).split(n, None).unwrap();
                assert_partition(&folds, n);
            }
        }
    }

    #[test]
    fn test_kfold_unshuffled_is_contiguous() {
        let folds = KFold::new(3, false, 0).split(7, None).unwrap();
        assert_eq!(folds.labels(), &[0, 0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_kfold_deterministic_seed() {
        let a = KFold::new(3, true, 42).split(30, None).unwrap();
        let b = KFold::new(3, true, 42).split(30, None).unwrap();
        let c = KFold::new(3, true, 43).split(30, None).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fold_count_errors() {
        assert!(matches!(
            KFold::new(1, true, 0).split(10, None),
            Err(DmlError::Configuration(_))
        ));
        assert!(matches!(
            KFold::new(6, true, 0).split(5, None),
            Err(DmlError::Configuration(_))
        ));
        assert!(StratifiedKFold::new(3, true, 0).split(2, None).is_err());
    }

    #[test]
    fn test_stratified_spreads_strata() {
        let strata: Vec<usize> = (0..60).map(|i| if i < 12 { 1 } else { 0 }).collect();
        let folds = StratifiedKFold::new(4, true, 3).split(60, Some(&strata)).unwrap();
        assert_partition(&folds, 60);
        for k in 0..4 {
            let minority = folds.test_indices(k).iter().filter(|&&i| strata[i] == 1).count();
            assert_eq!(minority, 3, "fold {k} should hold a quarter of the minority stratum");
        }
    }

    #[test]
    fn test_stratified_rejects_bad_strata() {
        assert!(StratifiedKFold::new(2, true, 0).split(5, Some(&[0, 1])).is_err());
    }

    #[test]
    fn test_from_labels() {
        let folds = FoldAssignment::from_labels(vec![0, 1, 1, 0], 2).unwrap();
        assert_eq!(folds.fold_of(2), 1);
        assert_eq!(folds.n_rows(), 4);
        assert!(FoldAssignment::from_labels(vec![0, 0, 0], 2).is_err());
        assert!(FoldAssignment::from_labels(vec![0, 2, 1], 2).is_err());
    }

    #[test]
    fn test_fixed_assignment_as_splitter() {
        let folds = FoldAssignment::from_labels(vec![2, 0, 1, 0, 2, 1], 3).unwrap();
        let again = folds.split(6, Some(&[0, 0, 1, 1, 0, 1])).unwrap();
        assert_eq!(again, folds);
        assert!(matches!(folds.split(5, None), Err(DmlError::Configuration(_))));
    }
}
