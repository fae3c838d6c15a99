use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cox_survival::diagnostics::check_proportional_hazards;
use cox_survival::metrics::harrell_c_index;
use cox_survival::optimization::{PartialLikelihood, TieMethod};
use cox_survival::{
    build, impute, parse_formula, pool, validate, CovariateSpec, CoxModel, Dataset, ImputationConfig, RawRecord,
    SurvivalRegression,
};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `n_features` continuous covariates x0.., the first three carry effects 0.5, -0.3, 0.2
fn generate_synthetic_data(n_samples: usize, n_features: usize, missing_rate: f64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(42);
    let specs: Vec<CovariateSpec> = (0..n_features).map(|j| CovariateSpec::continuous(format!("x{}", j))).collect();
    let true_coefficients = [0.5, -0.3, 0.2];

    let records: Vec<RawRecord> = (0..n_samples)
        .map(|_| {
            let x: Vec<f64> = (0..n_features).map(|_| rng.gen_range(-2.0..2.0)).collect();
            let linear_pred: f64 = x.iter().zip(true_coefficients.iter()).map(|(a, b)| a * b).sum();

            let u: f64 = rng.r#gen();
            let time = (-(1.0 - u).ln() / (0.1 * linear_pred.exp())).max(0.01);
            let censoring_time = rng.gen_range(1.0..10.0);

            let mut record = RawRecord::new(time.min(censoring_time), (time < censoring_time) as i64);
            for (j, value) in x.into_iter().enumerate() {
                // x0 stays complete so every imputation model has an anchor
                record = if j > 0 && rng.gen_bool(missing_rate) {
                    record.with_missing(format!("x{}", j))
                } else {
                    record.with_numeric(format!("x{}", j), value)
                };
            }
            record
        })
        .collect();

    validate(&records, &specs).unwrap()
}

fn formula_for(n_features: usize) -> String {
    (0..n_features).map(|j| format!("x{}", j)).collect::<Vec<_>>().join(" + ")
}

fn benchmark_cox_fitting(c: &mut Criterion) {
    let mut group = c.benchmark_group("cox_fitting");

    for &n_samples in [100, 500, 2000].iter() {
        for &n_features in [5, 10, 20].iter() {
            let data = generate_synthetic_data(n_samples, n_features, 0.0);
            let design = build(&data, &parse_formula(&formula_for(n_features)).unwrap()).unwrap();
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{}x{}", n_samples, n_features)),
                &design,
                |b, design| {
                    b.iter(|| CoxModel::new().fit_design(black_box(design)).unwrap());
                },
            );
        }
    }
    group.finish();
}

fn benchmark_likelihood_derivatives(c: &mut Criterion) {
    let mut group = c.benchmark_group("likelihood_derivatives");

    let data = generate_synthetic_data(1000, 10, 0.0);
    let design = build(&data, &parse_formula(&formula_for(10)).unwrap()).unwrap();
    let problem = PartialLikelihood::new(design.x(), design.times(), design.events(), None).unwrap();
    let beta = Array1::from_elem(10, 0.05);

    for ties in [TieMethod::Efron, TieMethod::Breslow] {
        group.bench_function(format!("{:?}", ties), |b| {
            b.iter(|| problem.compute_likelihood_derivatives(black_box(&beta), ties));
        });
    }
    group.finish();
}

fn benchmark_imputation(c: &mut Criterion) {
    let mut group = c.benchmark_group("imputation");
    group.sample_size(10);

    for &n_samples in [200, 1000].iter() {
        let data = generate_synthetic_data(n_samples, 5, 0.2);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_samples_m5", n_samples)),
            &data,
            |b, data| {
                let config = ImputationConfig::new().with_m(5).with_max_iterations(5);
                b.iter(|| impute(black_box(data), &config).unwrap());
            },
        );
    }
    group.finish();
}

fn benchmark_pooling_and_diagnostics(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_fit");

    let data = generate_synthetic_data(500, 8, 0.0);
    let design = build(&data, &parse_formula(&formula_for(8)).unwrap()).unwrap();
    let fit = CoxModel::new().fit_design(&design).unwrap();
    let fits = vec![fit.clone(); 20];
    let risk = design.x().dot(fit.coefficients());

    group.bench_function("pool_20", |b| {
        b.iter(|| pool(black_box(&fits)).unwrap());
    });

    group.bench_function("harrell_c_index", |b| {
        b.iter(|| {
            harrell_c_index(
                black_box(risk.view()),
                black_box(design.times()),
                black_box(design.events()),
                None,
            )
            .unwrap()
        });
    });

    group.bench_function("ph_test", |b| {
        b.iter(|| check_proportional_hazards(black_box(&fit), &design, design.times(), design.events()).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_cox_fitting,
    benchmark_likelihood_derivatives,
    benchmark_imputation,
    benchmark_pooling_and_diagnostics
);
criterion_main!(benches);
