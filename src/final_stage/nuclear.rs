//! Nuclear-norm penalised final stage.
//!
//! Minimises, jointly over all outcome columns,
//!
//! $$\frac{1}{2 \sum w} \sum_i w_i \lVert y_i - B z_i \rVert^2 + \lambda \sum_k \lVert B_k \rVert_*$$
//!
//! where $B_k$ is the $d_y \times d_t$ slice of the coefficients on feature
//! $k$. Solved with FISTA; the proximal step soft-thresholds the singular
//! values of every slice.
use crate::errors::DmlError;
use crate::final_stage::DesignShape;
use nalgebra::DMatrix;

pub struct NuclearNormFit {
    pub coef: DMatrix<f64>,
    pub converged: bool,
    pub iterations: usize,
}

/// Soft-threshold the singular values of `m` by `threshold`.
pub fn singular_value_threshold(m: &DMatrix<f64>, threshold: f64) -> Result<DMatrix<f64>, DmlError> {
    let mut svd = m.clone().svd(true, true);
    for s in svd.singular_values.iter_mut() {
        *s = (*s - threshold).max(0.0);
    }
    svd.recompose()
        .map_err(|e| DmlError::Configuration(format!("singular value thresholding failed: {e}")))
}

fn prox(b: &DMatrix<f64>, shape: DesignShape, threshold: f64) -> Result<DMatrix<f64>, DmlError> {
    let mut out = b.clone();
    for k in 0..shape.d_phi {
        let slice = DMatrix::from_fn(shape.d_y, shape.d_t, |i, j| b[(i, shape.column(j, k))]);
        let shrunk = singular_value_threshold(&slice, threshold)?;
        for i in 0..shape.d_y {
            for j in 0..shape.d_t {
                out[(i, shape.column(j, k))] = shrunk[(i, j)];
            }
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
pub fn fit_nuclear_norm(
    design: &DMatrix<f64>,
    target: &DMatrix<f64>,
    shape: DesignShape,
    sample_weight: Option<&[f64]>,
    lambda: f64,
    max_iter: usize,
    tol: f64,
) -> Result<NuclearNormFit, DmlError> {
    let (n, p) = design.shape();
    if p != shape.n_columns() || target.shape() != (n, shape.d_y) {
        return Err(DmlError::Configuration(format!(
            "final stage got a {n} x {p} design and a {} x {} target for shape {:?}",
            target.nrows(),
            target.ncols(),
            shape
        )));
    }
    let w: Vec<f64> = match sample_weight {
        Some(w) => w.to_vec(),
        None => vec![1.0; n],
    };
    let w_total: f64 = w.iter().sum();
    // Rows scaled by w / Σw, so gradients are plain matrix products.
    let wz = DMatrix::from_fn(n, p, |i, j| w[i] / w_total * design[(i, j)]);
    let gram = design.transpose() * &wz;
    let cross = target.transpose() * &wz;

    let lipschitz = gram.clone().symmetric_eigenvalues().max();
    if lipschitz <= 0.0 {
        return Ok(NuclearNormFit {
            coef: DMatrix::zeros(shape.d_y, p),
            converged: true,
            iterations: 0,
        });
    }
    let step = 1.0 / lipschitz;

    let mut b = DMatrix::zeros(shape.d_y, p);
    let mut momentum = b.clone();
    let mut t = 1.0_f64;
    for iter in 1..=max_iter {
        // ∇f(B) = B Zᵀ W Z / Σw − Yᵀ W Z / Σw
        let grad = &momentum * &gram - &cross;
        let next = prox(&(&momentum - grad * step), shape, lambda * step)?;
        let t_next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
        let diff = &next - &b;
        let change = diff.amax();
        momentum = &next + diff * ((t - 1.0) / t_next);
        let scale = next.amax().max(1.0);
        b = next;
        t = t_next;
        if change <= tol * scale {
            return Ok(NuclearNormFit {
                coef: b,
                converged: true,
                iterations: iter,
            });
        }
    }
    Ok(NuclearNormFit {
        coef: b,
        converged: false,
        iterations: max_iter,
    })
}
