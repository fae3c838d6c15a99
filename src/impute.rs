//! Multiple imputation by chained equations with predictive mean matching.
//!
//! Each chain starts from random draws of observed values, then cycles over
//! the incomplete variables in declared order. A variable is regressed on the
//! current state of every other variable (and, optionally, the outcome);
//! missing cells receive the observed value of a donor whose prediction is
//! close to theirs. Chains are independent and run in parallel.

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{ChiSquared, Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::convert::{to_dmatrix, to_dvector};
use crate::data::{Column, CovariateKind, Dataset};
use crate::error::{Result, SurvivalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImputationMethod {
    /// predictive mean matching, multivariate on indicators for categorical targets
    #[default]
    Pmm,
}

/// Settings for the chained-equation imputer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationConfig {
    /// number of completed datasets
    pub m: usize,
    pub method: ImputationMethod,
    /// cycles over all incomplete variables per chain
    pub max_iterations: usize,
    /// candidate donors per missing cell
    pub donors: usize,
    /// predictor columns allowed per imputation model
    pub max_predictors: usize,
    /// predictor list applied to every target without its own override
    pub predictors: Option<Vec<String>>,
    /// per-target predictor lists
    pub predictor_overrides: BTreeMap<String, Vec<String>>,
    /// add event status and Nelson-Aalen cumulative hazard as predictors
    pub include_outcome: bool,
    pub seed: u64,
    /// warn when the last cycle moves an imputed mean by more than this many observed SDs
    pub convergence_tolerance: f64,
    /// ridge added to the normal equations, relative to their diagonal
    pub ridge: f64,
}

impl Default for ImputationConfig {
    fn default() -> Self {
        Self {
            m: 5,
            method: ImputationMethod::Pmm,
            max_iterations: 10,
            donors: 5,
            max_predictors: 25,
            predictors: None,
            predictor_overrides: BTreeMap::new(),
            include_outcome: true,
            seed: 2024,
            convergence_tolerance: 0.5,
            ridge: 1e-5,
        }
    }
}

impl ImputationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_iterations(mut self, cycles: usize) -> Self {
        self.max_iterations = cycles;
        self
    }

    pub fn with_donors(mut self, donors: usize) -> Self {
        self.donors = donors;
        self
    }

    pub fn with_max_predictors(mut self, ceiling: usize) -> Self {
        self.max_predictors = ceiling;
        self
    }

    pub fn with_predictors<S: Into<String>>(mut self, names: Vec<S>) -> Self {
        self.predictors = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// restrict the imputation model for `target` to `names`
    pub fn with_predictors_for<S: Into<String>>(mut self, target: impl Into<String>, names: Vec<S>) -> Self {
        self.predictor_overrides
            .insert(target.into(), names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_outcome(mut self, include: bool) -> Self {
        self.include_outcome = include;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.m == 0 {
            return Err(SurvivalError::invalid_parameter("m", "0"));
        }
        if self.donors == 0 {
            return Err(SurvivalError::invalid_parameter("donors", "0"));
        }
        if self.max_iterations == 0 {
            return Err(SurvivalError::invalid_parameter("max_iterations", "0"));
        }
        if !(self.ridge >= 0.0) {
            return Err(SurvivalError::invalid_parameter("ridge", self.ridge.to_string()));
        }
        Ok(())
    }
}

/// per-cycle mean of the imputed cells of one variable in one chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTrace {
    pub chain: usize,
    pub variable: String,
    /// categorical variables trace the mean level index
    pub means: Vec<f64>,
}

/// a chain that was still moving when the cycles ran out
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceWarning {
    pub chain: usize,
    pub variable: String,
    pub change: f64,
    pub threshold: f64,
}

/// m completed datasets plus chain diagnostics
#[derive(Debug, Clone)]
pub struct ImputedDatasetSet {
    datasets: Vec<Dataset>,
    traces: Vec<ChainTrace>,
    warnings: Vec<ConvergenceWarning>,
}

impl ImputedDatasetSet {
    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn into_datasets(self) -> Vec<Dataset> {
        self.datasets
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Dataset> {
        self.datasets.iter()
    }

    pub fn traces(&self) -> &[ChainTrace] {
        &self.traces
    }

    /// traces of one variable, one per chain
    pub fn traces_for<'a>(&'a self, variable: &'a str) -> impl Iterator<Item = &'a ChainTrace> + 'a {
        self.traces.iter().filter(move |t| t.variable == variable)
    }

    pub fn warnings(&self) -> &[ConvergenceWarning] {
        &self.warnings
    }

    pub fn converged(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// one incomplete variable and how it is modelled
#[derive(Debug, Clone)]
struct Target {
    index: usize,
    name: String,
    missing: Vec<usize>,
    observed: Vec<usize>,
    predictors: Vec<usize>,
    /// Some(levels) for categorical targets
    n_levels: Option<usize>,
    observed_sd: f64,
}

struct ChainOutput {
    dataset: Dataset,
    traces: Vec<ChainTrace>,
    warnings: Vec<ConvergenceWarning>,
}

/// Impute every missing covariate value `config.m` times.
pub fn impute(dataset: &Dataset, config: &ImputationConfig) -> Result<ImputedDatasetSet> {
    config.validate()?;

    if !dataset.has_missing() {
        log::debug!("no missing values - returning {} copies", config.m);
        return Ok(ImputedDatasetSet {
            datasets: vec![dataset.clone(); config.m],
            traces: Vec::new(),
            warnings: Vec::new(),
        });
    }

    let targets = plan_targets(dataset, config)?;
    let outcome = if config.include_outcome {
        Some(outcome_predictors(dataset))
    } else {
        None
    };

    log::info!(
        "imputing {} variables ({} cells) with m = {}, {} cycles",
        targets.len(),
        dataset.total_missing(),
        config.m,
        config.max_iterations
    );

    let chains: Vec<ChainOutput> = (0..config.m)
        .into_par_iter()
        .map(|chain| run_chain(dataset, &targets, outcome.as_ref(), config, chain))
        .collect::<Result<Vec<_>>>()?;

    let mut datasets = Vec::with_capacity(config.m);
    let mut traces = Vec::new();
    let mut warnings = Vec::new();
    for output in chains {
        datasets.push(output.dataset);
        traces.extend(output.traces);
        warnings.extend(output.warnings);
    }
    for w in &warnings {
        log::warn!(
            "chain {} for `{}` still moving: last change {:.4} > {:.4}",
            w.chain,
            w.variable,
            w.change,
            w.threshold
        );
    }

    Ok(ImputedDatasetSet {
        datasets,
        traces,
        warnings,
    })
}

fn plan_targets(dataset: &Dataset, config: &ImputationConfig) -> Result<Vec<Target>> {
    let specs = dataset.specs();
    let outcome_columns = if config.include_outcome { 2 } else { 0 };
    let mut targets = Vec::new();

    for (index, (spec, column)) in specs.iter().zip(dataset.columns()).enumerate() {
        let (missing, observed): (Vec<usize>, Vec<usize>) =
            (0..column.len()).partition(|&r| column.is_missing(r));
        if missing.is_empty() {
            continue;
        }
        if observed.is_empty() {
            return Err(SurvivalError::schema(format!(
                "`{}` has no observed values to impute from",
                spec.name
            )));
        }

        let names = config
            .predictor_overrides
            .get(&spec.name)
            .or(config.predictors.as_ref());
        let predictors: Vec<usize> = match names {
            Some(list) => list
                .iter()
                .filter(|n| **n != spec.name)
                .map(|n| {
                    dataset.index_of(n).ok_or_else(|| {
                        SurvivalError::schema(format!("unknown predictor `{}` for `{}`", n, spec.name))
                    })
                })
                .collect::<Result<_>>()?,
            None => (0..specs.len()).filter(|&j| j != index).collect(),
        };

        let count: usize = predictors.iter().map(|&j| predictor_width(&specs[j].kind)).sum::<usize>()
            + outcome_columns;
        if count > config.max_predictors {
            return Err(SurvivalError::TooManyPredictors {
                variable: spec.name.clone(),
                count,
                ceiling: config.max_predictors,
            });
        }

        let values: Vec<f64> = observed.iter().filter_map(|&r| column.numeric(r)).collect();
        targets.push(Target {
            index,
            name: spec.name.clone(),
            n_levels: spec.levels().map(<[String]>::len),
            observed_sd: std_dev(&values),
            missing,
            observed,
            predictors,
        });
    }
    Ok(targets)
}

fn predictor_width(kind: &CovariateKind) -> usize {
    match kind {
        CovariateKind::Continuous => 1,
        CovariateKind::Categorical { levels } | CovariateKind::Stratum { levels } => {
            levels.len().saturating_sub(1)
        }
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// status and Nelson-Aalen cumulative hazard at each subject's own time
struct OutcomePredictors {
    status: Vec<f64>,
    cumulative_hazard: Vec<f64>,
}

fn outcome_predictors(dataset: &Dataset) -> OutcomePredictors {
    let times = dataset.times();
    let events = dataset.events();
    let n = times.len();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

    let mut cumulative_hazard = vec![0.0; n];
    let mut hazard = 0.0;
    let mut i = 0;
    while i < n {
        let t = times[order[i]];
        let at_risk = (n - i) as f64;
        let mut j = i;
        let mut deaths = 0.0;
        while j < n && times[order[j]] == t {
            if events[order[j]] {
                deaths += 1.0;
            }
            j += 1;
        }
        hazard += deaths / at_risk;
        for &r in &order[i..j] {
            cumulative_hazard[r] = hazard;
        }
        i = j;
    }

    OutcomePredictors {
        status: events.iter().map(|&e| if e { 1.0 } else { 0.0 }).collect(),
        cumulative_hazard,
    }
}

fn run_chain(
    dataset: &Dataset,
    targets: &[Target],
    outcome: Option<&OutcomePredictors>,
    config: &ImputationConfig,
    chain: usize,
) -> Result<ChainOutput> {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(chain as u64));
    let mut columns: Vec<Column> = dataset.columns().to_vec();

    // start from random draws of observed values
    for target in targets {
        for &row in &target.missing {
            let donor = target.observed[rng.gen_range(0..target.observed.len())];
            copy_cell(&mut columns[target.index], donor, row);
        }
    }

    let mut means: Vec<Vec<f64>> = vec![Vec::with_capacity(config.max_iterations); targets.len()];
    for cycle in 0..config.max_iterations {
        for (k, target) in targets.iter().enumerate() {
            let x = predictor_matrix(&columns, dataset, &target.predictors, outcome);
            let x_obs = x.select(Axis(0), &target.observed);
            let x_mis = x.select(Axis(0), &target.missing);

            let y_obs = match target.n_levels {
                None => Array2::from_shape_fn((target.observed.len(), 1), |(i, _)| {
                    columns[target.index].numeric(target.observed[i]).unwrap_or(0.0)
                }),
                Some(levels) => Array2::from_shape_fn((target.observed.len(), levels), |(i, l)| {
                    let level = columns[target.index].numeric(target.observed[i]).unwrap_or(0.0) as usize;
                    if level == l {
                        1.0
                    } else {
                        0.0
                    }
                }),
            };

            let (fitted_obs, predicted_mis) = draw_predictions(&x_obs, &x_mis, &y_obs, config.ridge, &mut rng)
                .map_err(|e| match e {
                    SurvivalError::NumericalError { message } => SurvivalError::numerical_error(format!(
                        "imputation model for `{}`: {}",
                        target.name, message
                    )),
                    other => other,
                })?;
            let donors = match_donors(&fitted_obs, &predicted_mis, config.donors, &mut rng);

            let mut total = 0.0;
            for (&row, &donor) in target.missing.iter().zip(&donors) {
                let source = target.observed[donor];
                copy_cell(&mut columns[target.index], source, row);
                total += columns[target.index].numeric(row).unwrap_or(0.0);
            }
            means[k].push(total / target.missing.len() as f64);
        }
        log::debug!("chain {} finished cycle {}", chain, cycle + 1);
    }

    let mut completed = dataset.clone();
    let mut traces = Vec::with_capacity(targets.len());
    let mut warnings = Vec::new();
    for (target, trace) in targets.iter().zip(means) {
        completed.replace_column(target.index, columns[target.index].clone());

        if let [.., previous, last] = trace.as_slice() {
            let change = (last - previous).abs();
            let threshold = config.convergence_tolerance * target.observed_sd;
            if change > threshold {
                warnings.push(ConvergenceWarning {
                    chain,
                    variable: target.name.clone(),
                    change,
                    threshold,
                });
            }
        }
        traces.push(ChainTrace {
            chain,
            variable: target.name.clone(),
            means: trace,
        });
    }

    Ok(ChainOutput {
        dataset: completed,
        traces,
        warnings,
    })
}

fn copy_cell(column: &mut Column, from: usize, to: usize) {
    match column {
        Column::Continuous(v) => v[to] = v[from],
        Column::Categorical(v) => v[to] = v[from],
    }
}

/// intercept, every predictor (categorical as non-reference indicators), then the outcome
fn predictor_matrix(
    columns: &[Column],
    dataset: &Dataset,
    predictors: &[usize],
    outcome: Option<&OutcomePredictors>,
) -> Array2<f64> {
    let n = dataset.n_samples();
    let specs = dataset.specs();
    let width = 1
        + predictors.iter().map(|&j| predictor_width(&specs[j].kind)).sum::<usize>()
        + if outcome.is_some() { 2 } else { 0 };

    let mut x = Array2::zeros((n, width));
    x.column_mut(0).fill(1.0);
    let mut at = 1;
    for &j in predictors {
        match &columns[j] {
            Column::Continuous(values) => {
                for (i, v) in values.iter().enumerate() {
                    x[[i, at]] = v.unwrap_or(0.0);
                }
                at += 1;
            }
            Column::Categorical(values) => {
                let w = predictor_width(&specs[j].kind);
                for (i, v) in values.iter().enumerate() {
                    if let Some(level) = v {
                        if *level > 0 {
                            x[[i, at + level - 1]] = 1.0;
                        }
                    }
                }
                at += w;
            }
        }
    }
    if let Some(outcome) = outcome {
        for i in 0..n {
            x[[i, at]] = outcome.status[i];
            x[[i, at + 1]] = outcome.cumulative_hazard[i];
        }
    }
    x
}

/// Ridge least squares on the observed rows, with a Bayesian draw of
/// coefficients (scaled inverse chi-square residual variance) for the
/// missing rows. Returns (observed fitted values, missing predictions).
fn draw_predictions(
    x_obs: &Array2<f64>,
    x_mis: &Array2<f64>,
    y_obs: &Array2<f64>,
    ridge: f64,
    rng: &mut StdRng,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let (n_obs, p) = x_obs.dim();
    let mut xtx = x_obs.t().dot(x_obs);
    for j in 0..p {
        xtx[[j, j]] += ridge * (xtx[[j, j]] + 1.0);
    }
    let chol = to_dmatrix(&xtx)
        .cholesky()
        .ok_or_else(|| SurvivalError::numerical_error("normal equations aren't positive definite"))?;
    let l_t = chol.l().transpose();

    let df = n_obs.saturating_sub(p).max(1) as f64;
    let chi2 = ChiSquared::new(df).map_err(|e| SurvivalError::numerical_error(e.to_string()))?;

    let q = y_obs.ncols();
    let mut fitted = Array2::zeros((n_obs, q));
    let mut predicted = Array2::zeros((x_mis.nrows(), q));
    for c in 0..q {
        let y = y_obs.column(c);
        let xty = x_obs.t().dot(&y);
        let beta_hat = Array1::from_vec(chol.solve(&to_dvector(&xty)).as_slice().to_vec());

        let fit_obs = x_obs.dot(&beta_hat);
        let rss: f64 = (&y - &fit_obs).mapv(|r| r * r).sum();
        let sigma = (rss / chi2.sample(rng)).sqrt();

        // beta* = beta_hat + sigma L^-T z  ~  N(beta_hat, sigma^2 (X'X)^-1)
        let z = nalgebra::DVector::from_fn(p, |_, _| rng.sample::<f64, _>(StandardNormal));
        let offset = l_t
            .solve_upper_triangular(&z)
            .ok_or_else(|| SurvivalError::numerical_error("triangular solve failed"))?;
        let beta_star = Array1::from_shape_fn(p, |j| beta_hat[j] + sigma * offset[j]);

        fitted.slice_mut(s![.., c]).assign(&fit_obs);
        predicted.slice_mut(s![.., c]).assign(&x_mis.dot(&beta_star));
    }
    Ok((fitted, predicted))
}

/// For each missing row, pick one of the `k` observed rows with the closest
/// predictions (squared euclidean distance), uniformly at random.
fn match_donors(fitted_obs: &Array2<f64>, predicted_mis: &Array2<f64>, k: usize, rng: &mut StdRng) -> Vec<usize> {
    let n_obs = fitted_obs.nrows();
    let k = k.min(n_obs).max(1);
    let mut candidates: Vec<(f64, usize)> = Vec::with_capacity(n_obs);

    predicted_mis
        .outer_iter()
        .map(|target| {
            candidates.clear();
            candidates.extend(fitted_obs.outer_iter().enumerate().map(|(i, row)| {
                let d: f64 = row.iter().zip(target.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                (d, i)
            }));
            let by_distance = |a: &(f64, usize), b: &(f64, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
            if k < n_obs {
                candidates.select_nth_unstable_by(k - 1, by_distance);
            }
            candidates[..k].sort_by(by_distance);
            candidates[rng.gen_range(0..k)].1
        })
        .collect()
}
