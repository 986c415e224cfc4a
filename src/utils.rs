use crate::errors::DmlError;
use std::collections::VecDeque;

// Validation
pub fn validate_positive_float_parameter(value: f64, parameter: &str) -> Result<(), DmlError> {
    validate_float_parameter(value, 0.0, f64::INFINITY, parameter)
}

pub fn validate_float_parameter(value: f64, min: f64, max: f64, parameter: &str) -> Result<(), DmlError> {
    if value.is_nan() || value < min || max < value {
        let ex_msg = format!("real value within range {} and {}", min, max);
        Err(DmlError::InvalidParameter(
            parameter.to_string(),
            ex_msg,
            value.to_string(),
        ))
    } else {
        Ok(())
    }
}

pub fn validate_min_usize_parameter(value: usize, min: usize, parameter: &str) -> Result<(), DmlError> {
    if value < min {
        Err(DmlError::InvalidParameter(
            parameter.to_string(),
            format!("integer of at least {}", min),
            value.to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Weighted percentiles of `v`, `percentiles` must be sorted ascending and lie in [0, 1].
pub fn percentiles(v: &[f64], sample_weight: &[f64], percentiles: &[f64]) -> Vec<f64> {
    if v.is_empty() || percentiles.is_empty() {
        return Vec::new();
    }
    let mut idx: Vec<usize> = (0..v.len()).collect();
    idx.sort_unstable_by(|a, b| v[*a].total_cmp(&v[*b]));

    let mut pcts = VecDeque::from_iter(percentiles.iter());
    let mut current_pct = match pcts.pop_front() {
        Some(p_) => *p_,
        None => return Vec::new(),
    };

    let mut p = Vec::with_capacity(percentiles.len());
    let mut cuml_pct = 0.0;
    let total_values: f64 = sample_weight.iter().sum();

    for i in idx.iter() {
        cuml_pct += sample_weight[*i] / total_values;
        // The same value can satisfy several percentiles.
        while cuml_pct >= current_pct - f64::EPSILON {
            p.push(v[*i]);
            match pcts.pop_front() {
                Some(p_) => current_pct = *p_,
                None => return p,
            }
        }
    }
    // Rounding can leave the top percentiles unfilled.
    while p.len() < percentiles.len() {
        p.push(v[idx[idx.len() - 1]]);
    }
    p
}

/// Weighted mean squared error of a residual column.
pub fn weighted_mse<'a, I>(residuals: I, sample_weight: Option<&[f64]>) -> f64
where
    I: IntoIterator<Item = &'a f64>,
{
    match sample_weight {
        Some(w) => {
            let total: f64 = w.iter().sum();
            residuals.into_iter().zip(w).map(|(r, wi)| wi * r * r).sum::<f64>() / total
        }
        None => {
            let mut n = 0usize;
            let mut s = 0.0;
            for r in residuals {
                s += r * r;
                n += 1;
            }
            if n == 0 {
                0.0
            } else {
                s / n as f64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let v = vec![4., 5., 6., 1., 2., 3., 7., 8., 9., 10.];
        let w = vec![1.; v.len()];
        let p = vec![0.3, 0.5, 0.75, 1.0];
        let p = percentiles(&v, &w, &p);
        assert_eq!(p, vec![3.0, 5.0, 8.0, 10.0]);
    }

    #[test]
    fn test_percentiles_weighted() {
        let v = vec![10., 8., 9., 1., 2., 3., 6., 7., 4., 5.];
        let w = vec![1., 1., 1., 1., 1., 2., 1., 1., 5., 1.];
        let p = vec![0.3, 0.5, 0.75, 1.0];
        let p = percentiles(&v, &w, &p);
        assert_eq!(p, vec![4.0, 4.0, 7.0, 10.0]);
    }

    #[test]
    fn test_validate_float_parameter() {
        assert!(validate_float_parameter(0.5, 0.0, 1.0, "alpha").is_ok());
        assert!(validate_float_parameter(1.5, 0.0, 1.0, "alpha").is_err());
        assert!(validate_float_parameter(f64::NAN, 0.0, 1.0, "alpha").is_err());
        assert!(validate_positive_float_parameter(-1.0, "alpha").is_err());
        assert!(validate_min_usize_parameter(1, 2, "n_folds").is_err());
    }

    #[test]
    fn test_weighted_mse() {
        let r = [1.0, -2.0];
        assert_eq!(weighted_mse(r.iter(), None), 2.5);
        assert_eq!(weighted_mse(r.iter(), Some(&[1.0, 0.0])), 1.0);
    }
}
