//! Weighted ordinary least squares with sandwich covariance.
use crate::errors::DmlError;
use crate::final_stage::regression::CovType;
use nalgebra::{DMatrix, DVector};

/// Coefficients (`d_y × p`) and, per outcome column, the `p × p` covariance.
pub struct OlsFit {
    pub coef: DMatrix<f64>,
    pub covariance: Vec<DMatrix<f64>>,
}

/// Fit every outcome column on the same design.
///
/// Requires full column rank, otherwise returns `DesignRank`. The covariance
/// uses the bread `(Zᵀ W Z)⁻¹` and, for the HC estimators, the meat
/// `Σ wᵢ² eᵢ² zᵢ zᵢᵀ`.
pub fn fit_ols(
    design: &DMatrix<f64>,
    target: &DMatrix<f64>,
    sample_weight: Option<&[f64]>,
    cov_type: CovType,
) -> Result<OlsFit, DmlError> {
    let (n, p) = design.shape();
    let sqrt_w: Vec<f64> = match sample_weight {
        Some(w) => w.iter().map(|v| v.sqrt()).collect(),
        None => vec![1.0; n],
    };
    if p == 0 || n < p {
        return Err(DmlError::DesignRank { rank: n.min(p), cols: p });
    }

    let wz = DMatrix::from_fn(n, p, |i, j| sqrt_w[i] * design[(i, j)]);
    let wy = DMatrix::from_fn(n, target.ncols(), |i, j| sqrt_w[i] * target[(i, j)]);

    let svd = wz.svd(true, true);
    let s_max = svd.singular_values.max();
    // Singular values at or below `s_max · ε · max(n, p)` count as zero.
    let cutoff = s_max * f64::EPSILON * n.max(p) as f64;
    let rank = svd.singular_values.iter().filter(|s| **s > cutoff).count();
    if s_max <= 0.0 || rank < p {
        return Err(DmlError::DesignRank { rank, cols: p });
    }

    // Solution is p × d_y.
    let beta = svd.solve(&wy, cutoff).map_err(|e| DmlError::Configuration(e.to_string()))?;
    let v_t = svd.v_t.as_ref().ok_or_else(|| DmlError::Configuration("missing right singular vectors".to_string()))?;
    let inv_s2 = DVector::from_fn(p, |k, _| 1.0 / (svd.singular_values[k] * svd.singular_values[k]));
    let bread = v_t.transpose() * DMatrix::from_diagonal(&inv_s2) * v_t;

    let fitted = design * &beta;
    let mut covariance = Vec::with_capacity(target.ncols());
    for l in 0..target.ncols() {
        let resid: Vec<f64> = (0..n).map(|i| target[(i, l)] - fitted[(i, l)]).collect();
        let cov = match cov_type {
            CovType::Nonrobust => {
                let dof = (n - p).max(1) as f64;
                let rss: f64 = resid.iter().zip(&sqrt_w).map(|(e, sw)| sw * sw * e * e).sum();
                &bread * (rss / dof)
            }
            CovType::HC0 | CovType::HC1 => {
                let mut meat = DMatrix::zeros(p, p);
                for i in 0..n {
                    let s = sqrt_w[i] * sqrt_w[i] * resid[i];
                    let zi = design.row(i);
                    for a in 0..p {
                        let za = s * zi[a];
                        for b in 0..p {
                            meat[(a, b)] += za * s * zi[b];
                        }
                    }
                }
                let hc0 = &bread * meat * &bread;
                if cov_type == CovType::HC1 && n > p {
                    hc0 * (n as f64 / (n - p) as f64)
                } else {
                    hc0
                }
            }
        };
        covariance.push(cov);
    }

    Ok(OlsFit {
        coef: beta.transpose(),
        covariance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_solution() {
        // y0 = 2 z0 - z1, y1 = z1
        let z = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, -1.0]);
        let y = DMatrix::from_fn(4, 2, |i, l| {
            if l == 0 {
                2.0 * z[(i, 0)] - z[(i, 1)]
            } else {
                z[(i, 1)]
            }
        });
        let fit = fit_ols(&z, &y, None, CovType::HC1).unwrap();
        assert_eq!(fit.coef.shape(), (2, 2));
        assert!((fit.coef[(0, 0)] - 2.0).abs() < 1e-10);
        assert!((fit.coef[(0, 1)] + 1.0).abs() < 1e-10);
        assert!(fit.coef[(1, 0)].abs() < 1e-10);
        assert!((fit.coef[(1, 1)] - 1.0).abs() < 1e-10);
        // Perfect fit leaves no residual variance.
        assert!(fit.covariance[0].amax() < 1e-16);
    }

    #[test]
    fn test_nonrobust_covariance_single_regressor() {
        // Single regressor: var = s² / Σz², s² = RSS / (n - 1).
        let z = DMatrix::from_column_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]);
        let y = DMatrix::from_column_slice(4, 1, &[1.0, 2.5, 2.5, 4.0]);
        let fit = fit_ols(&z, &y, None, CovType::Nonrobust).unwrap();
        let beta: f64 = (1.0 + 5.0 + 7.5 + 16.0) / 30.0;
        assert!((fit.coef[(0, 0)] - beta).abs() < 1e-12);
        let rss: f64 = (0..4).map(|i| (y[(i, 0)] - beta * z[(i, 0)]).powi(2)).sum();
        let expected = rss / 3.0 / 30.0;
        assert!((fit.covariance[0][(0, 0)] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_hc1_scales_hc0() {
        let z = DMatrix::from_row_slice(5, 2, &[1.0, 0.3, 1.0, -0.2, 1.0, 1.1, 1.0, 0.7, 1.0, -0.9]);
        let y = DMatrix::from_column_slice(5, 1, &[0.5, 0.1, 1.9, 1.0, -0.4]);
        let hc0 = fit_ols(&z, &y, None, CovType::HC0).unwrap();
        let hc1 = fit_ols(&z, &y, None, CovType::HC1).unwrap();
        let ratio = hc1.covariance[0][(1, 1)] / hc0.covariance[0][(1, 1)];
        assert!((ratio - 5.0 / 3.0).abs() < 1e-10);
        assert!(hc0.covariance[0][(0, 0)] > 0.0);
    }

    #[test]
    fn test_rank_deficient_design() {
        let z = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 2.0, 0.0, 3.0, 0.0]);
        let y = DMatrix::from_column_slice(3, 1, &[1.0, 2.0, 3.0]);
        let res = fit_ols(&z, &y, None, CovType::HC1);
        assert!(matches!(res, Err(DmlError::DesignRank { rank: 1, cols: 2 })));
    }

    #[test]
    fn test_poorly_scaled_full_rank_design() {
        // Cubic basis on an unstandardised covariate, condition number near 1e9.
        let n = 1000;
        let z = DMatrix::from_fn(n, 4, |i, j| (100.0 + 0.4 * i as f64).powi(j as i32));
        let y = DMatrix::from_fn(n, 1, |i, _| {
            let x = z[(i, 1)];
            1.0 + 0.5 * x - 0.01 * x * x + 1e-5 * x * x * x
        });
        let fit = fit_ols(&z, &y, None, CovType::HC1).unwrap();
        let fitted = &z * fit.coef.transpose();
        let scale = y.amax();
        let max_err = (0..n).map(|i| (fitted[(i, 0)] - y[(i, 0)]).abs()).fold(0.0, f64::max);
        assert!(max_err / scale < 1e-8, "relative error {}", max_err / scale);
    }

    #[test]
    fn test_fewer_rows_than_columns() {
        let z = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        let y = DMatrix::from_column_slice(1, 1, &[1.0]);
        assert!(matches!(fit_ols(&z, &y, None, CovType::HC1), Err(DmlError::DesignRank { .. })));
    }

    #[test]
    fn test_weights_match_row_duplication() {
        let z = DMatrix::from_column_slice(3, 1, &[1.0, 2.0, 3.0]);
        let y = DMatrix::from_column_slice(3, 1, &[1.0, 3.0, 2.0]);
        let weighted = fit_ols(&z, &y, Some(&[1.0, 2.0, 1.0]), CovType::HC1).unwrap();
        let z_dup = DMatrix::from_column_slice(4, 1, &[1.0, 2.0, 2.0, 3.0]);
        let y_dup = DMatrix::from_column_slice(4, 1, &[1.0, 3.0, 3.0, 2.0]);
        let dup = fit_ols(&z_dup, &y_dup, None, CovType::HC1).unwrap();
        assert!((weighted.coef[(0, 0)] - dup.coef[(0, 0)]).abs() < 1e-12);
    }
}
