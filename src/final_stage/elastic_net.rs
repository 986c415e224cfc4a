//! Elastic net by cyclic coordinate descent.
//!
//! Minimises, for each outcome column independently,
//!
//! $$\frac{1}{2 \sum w} \sum_i w_i (y_i - z_i \beta)^2 + \alpha \rho \lVert\beta\rVert_1 + \frac{\alpha (1 - \rho)}{2} \lVert\beta\rVert_2^2$$
//!
//! with $\rho$ the `l1_ratio`. Lasso is the special case $\rho = 1$. There is
//! no intercept: the final stage regresses residuals, and a constant feature in
//! the basis plays that role.
use crate::errors::DmlError;
use nalgebra::DMatrix;
use rayon::prelude::*;

/// Coefficients (`d_y × p`) and, per outcome column, whether the sweep converged.
pub struct ElasticNetFit {
    pub coef: DMatrix<f64>,
    pub converged: Vec<bool>,
}

#[inline]
fn soft_threshold(v: f64, t: f64) -> f64 {
    if v > t {
        v - t
    } else if v < -t {
        v + t
    } else {
        0.0
    }
}

fn fit_column(
    design: &DMatrix<f64>,
    y: &[f64],
    w: &[f64],
    alpha: f64,
    l1_ratio: f64,
    max_iter: usize,
    tol: f64,
) -> (Vec<f64>, bool) {
    let (n, p) = design.shape();
    let w_total: f64 = w.iter().sum();
    let l1 = alpha * l1_ratio;
    let l2 = alpha * (1.0 - l1_ratio);
    let col_sq: Vec<f64> = (0..p)
        .map(|j| (0..n).map(|i| w[i] * design[(i, j)] * design[(i, j)]).sum::<f64>() / w_total)
        .collect();

    let mut beta = vec![0.0; p];
    let mut resid = y.to_vec();
    for _ in 0..max_iter {
        let mut max_change: f64 = 0.0;
        let mut max_coef: f64 = 0.0;
        for j in 0..p {
            let denom = col_sq[j] + l2;
            if denom <= 0.0 {
                continue;
            }
            let old = beta[j];
            let rho = (0..n)
                .map(|i| w[i] * design[(i, j)] * (resid[i] + design[(i, j)] * old))
                .sum::<f64>()
                / w_total;
            let new = soft_threshold(rho, l1) / denom;
            if new != old {
                let delta = new - old;
                for i in 0..n {
                    resid[i] -= design[(i, j)] * delta;
                }
                beta[j] = new;
                max_change = max_change.max(delta.abs());
            }
            max_coef = max_coef.max(new.abs());
        }
        if max_change <= tol * max_coef.max(1.0) {
            return (beta, true);
        }
    }
    (beta, false)
}

/// Fit the elastic net on every outcome column, in parallel over columns.
#[allow(clippy::too_many_arguments)]
pub fn fit_elastic_net(
    design: &DMatrix<f64>,
    target: &DMatrix<f64>,
    sample_weight: Option<&[f64]>,
    alpha: f64,
    l1_ratio: f64,
    max_iter: usize,
    tol: f64,
) -> Result<ElasticNetFit, DmlError> {
    let n = design.nrows();
    if target.nrows() != n {
        return Err(DmlError::Configuration(format!(
            "final stage design has {n} rows but the target has {}",
            target.nrows()
        )));
    }
    let w: Vec<f64> = match sample_weight {
        Some(w) => w.to_vec(),
        None => vec![1.0; n],
    };
    let columns: Vec<(Vec<f64>, bool)> = (0..target.ncols())
        .into_par_iter()
        .map(|l| {
            let y: Vec<f64> = target.column(l).iter().copied().collect();
            fit_column(design, &y, &w, alpha, l1_ratio, max_iter, tol)
        })
        .collect();

    let p = design.ncols();
    let mut coef = DMatrix::zeros(target.ncols(), p);
    let mut converged = Vec::with_capacity(columns.len());
    for (l, (beta, ok)) in columns.into_iter().enumerate() {
        for (j, b) in beta.into_iter().enumerate() {
            coef[(l, j)] = b;
        }
        converged.push(ok);
    }
    Ok(ElasticNetFit { coef, converged })
}
