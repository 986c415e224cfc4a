use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::DMatrix;
use orthoml::data::Matrix;
use orthoml::final_stage::{cross_product_design, FinalRegression};
use orthoml::{DmlConfig, Inference, LinearDml};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::time::Duration;

fn normal_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows, cols, |_, _| rng.sample::<f64, _>(StandardNormal))
}

fn view(m: &DMatrix<f64>) -> Matrix<'_, f64> {
    Matrix::new(m.as_slice(), m.nrows(), m.ncols())
}

pub fn dml_benchmarks(c: &mut Criterion) {
    let n = 20_000;
    let mut rng = StdRng::seed_from_u64(0);
    let x = normal_matrix(&mut rng, n, 3);
    let w = normal_matrix(&mut rng, n, 10);
    let eta = normal_matrix(&mut rng, n, 1);
    let eps = normal_matrix(&mut rng, n, 1);
    let t = DMatrix::from_fn(n, 1, |i, _| 0.5 * w[(i, 0)] - 0.2 * x[(i, 1)] + eta[(i, 0)]);
    let y = DMatrix::from_fn(n, 1, |i, _| {
        (1.0 + x[(i, 0)]) * t[(i, 0)] + w[(i, 2)] - w[(i, 3)] + eps[(i, 0)]
    });

    let design_t = normal_matrix(&mut rng, n, 3);
    let design_phi = normal_matrix(&mut rng, n, 8);
    c.bench_function("cross_product_design", |b| {
        b.iter(|| cross_product_design(black_box(&design_t), black_box(&design_phi)).unwrap())
    });

    let mut group = c.benchmark_group("dml_fit");
    group.warm_up_time(Duration::from_secs(3));
    group.measurement_time(Duration::from_secs(15));
    group.sample_size(10);

    group.bench_function("linear_dml_ols", |b| {
        b.iter(|| {
            let mut est = LinearDml::linear().set_config(DmlConfig::default().set_n_folds(5));
            est.fit(
                black_box(&view(&y)),
                black_box(&view(&t)),
                Some(&view(&x)),
                Some(&view(&w)),
                None,
            )
            .unwrap();
        })
    });
    group.bench_function("linear_dml_lasso", |b| {
        b.iter(|| {
            let mut est = LinearDml::linear()
                .set_config(DmlConfig::default().set_n_folds(5))
                .set_final_model(FinalRegression::lasso(0.01));
            est.fit(black_box(&view(&y)), black_box(&view(&t)), Some(&view(&x)), Some(&view(&w)), None)
                .unwrap();
        })
    });
    group.bench_function("linear_dml_bootstrap", |b| {
        b.iter(|| {
            let config = DmlConfig::default().set_inference(Inference::Bootstrap {
                n_bootstrap_samples: 50,
            });
            let mut est = LinearDml::linear().set_config(config);
            est.fit(black_box(&view(&y)), black_box(&view(&t)), Some(&view(&x)), Some(&view(&w)), None)
                .unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, dml_benchmarks);
criterion_main!(benches);
