//! Proportional-hazards diagnostics from Schoenfeld residuals.
//!
//! Under proportional hazards the scaled Schoenfeld residuals have no trend in
//! (a transform of) time. The test correlates them with the centred transform
//! per column, per term and globally. Fits are never modified.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::design::DesignMatrix;
use crate::error::{Result, SurvivalError};
use crate::inference::{pvalue_chi2, significance_stars};
use crate::model::{ChiSquareTest, FitResult};
use crate::optimization::PartialLikelihood;

/// time scale the residuals are regressed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeTransform {
    Identity,
    Log,
    /// ranks of the event times, ties averaged
    #[default]
    Rank,
    /// 1 - Kaplan-Meier just before each event
    KaplanMeier,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub transform: TimeTransform,
}

/// one column's trend test
#[derive(Debug, Clone, PartialEq)]
pub struct PhColumnTest {
    pub name: String,
    /// correlation of scaled residuals with transformed time
    pub rho: f64,
    pub statistic: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone)]
pub struct PhTest {
    pub per_column: Vec<PhColumnTest>,
    /// chunk tests for terms with more than one column
    pub per_term: Vec<ChiSquareTest>,
    pub global: ChiSquareTest,
    pub transform: TimeTransform,
    /// event times in increasing order
    pub event_times: Array1<f64>,
    pub transformed_times: Array1<f64>,
    /// one row per event: unscaled residual · V · d + beta
    pub scaled_residuals: Array2<f64>,
}

impl PhTest {
    pub fn column(&self, name: &str) -> Option<&PhColumnTest> {
        self.per_column.iter().find(|c| c.name == name)
    }

    pub fn print(&self) {
        println!("proportional hazards test ({:?} time scale)", self.transform);
        println!("{:<24} {:>8} {:>10} {:>10}", "column", "rho", "chi2", "p");
        println!("{:-<55}", "");
        for c in &self.per_column {
            println!(
                "{:<24} {:>8.4} {:>10.3} {:>10.4} {}",
                c.name,
                c.rho,
                c.statistic,
                c.p_value,
                significance_stars(c.p_value)
            );
        }
        for t in &self.per_term {
            println!("{}", t);
        }
        println!("{}", self.global);
    }
}

/// PH test with the default (rank) time transform
pub fn check_proportional_hazards(
    fit: &FitResult,
    design: &DesignMatrix,
    times: ArrayView1<f64>,
    events: &[bool],
) -> Result<PhTest> {
    check_proportional_hazards_with(fit, design, times, events, &DiagnosticsConfig::default())
}

pub fn check_proportional_hazards_with(
    fit: &FitResult,
    design: &DesignMatrix,
    times: ArrayView1<f64>,
    events: &[bool],
    config: &DiagnosticsConfig,
) -> Result<PhTest> {
    let p = fit.n_coefficients();
    if design.n_columns() != p {
        return Err(SurvivalError::invalid_dimensions(format!(
            "design has {} columns, fit has {} coefficients",
            design.n_columns(),
            p
        )));
    }

    let problem = PartialLikelihood::new(design.x(), times, events, design.strata())?;
    let mut contributions = problem.event_contributions(fit.coefficients(), fit.ties());
    contributions.sort_by(|a, b| a.time.total_cmp(&b.time));

    let d = contributions.len();
    if d < 2 {
        return Err(SurvivalError::numerical_error("need at least two events for a PH test"));
    }

    let x = design.x();
    let mut resid = Array2::<f64>::zeros((d, p));
    for (k, c) in contributions.iter().enumerate() {
        for j in 0..p {
            resid[[k, j]] = x[[c.row, j]] - c.expected[j];
        }
    }

    let event_times = Array1::from_iter(contributions.iter().map(|c| c.time));
    let transformed = transform_times(config.transform, &event_times, times, events);
    let mean_g = transformed.mean().unwrap_or(0.0);
    let xx = transformed.mapv(|g| g - mean_g);
    let sum_xx2 = xx.dot(&xx);
    if sum_xx2 <= 0.0 {
        return Err(SurvivalError::numerical_error(
            "event times don't vary on the chosen time scale",
        ));
    }

    let dn = d as f64;
    let var = fit.covariance();
    let r2 = resid.dot(var) * dn;
    let test_scaled = xx.dot(&r2);

    let per_column = (0..p)
        .map(|j| {
            let statistic = test_scaled[j].powi(2) / (var[[j, j]] * dn * sum_xx2);
            PhColumnTest {
                name: fit.column_names()[j].clone(),
                rho: correlation(xx.view(), r2.column(j)),
                statistic,
                p_value: pvalue_chi2(statistic, 1.0),
            }
        })
        .collect();

    // chunk and global tests use the unscaled residuals
    let test = xx.dot(&resid);
    let quadratic = |cols: &[usize]| -> f64 {
        let mut total = 0.0;
        for &a in cols {
            for &b in cols {
                total += test[a] * var[[a, b]] * test[b];
            }
        }
        total * dn / sum_xx2
    };

    let per_term = fit
        .blocks()
        .iter()
        .filter(|b| b.width() > 1)
        .map(|b| {
            let cols: Vec<usize> = b.columns.clone().collect();
            let statistic = quadratic(&cols);
            let df = cols.len() as f64;
            ChiSquareTest {
                label: b.label.clone(),
                statistic,
                df,
                p_value: pvalue_chi2(statistic, df),
            }
        })
        .collect();

    let all: Vec<usize> = (0..p).collect();
    let statistic = quadratic(&all);
    let global = ChiSquareTest {
        label: "GLOBAL".into(),
        statistic,
        df: p as f64,
        p_value: pvalue_chi2(statistic, p as f64),
    };
    log::debug!(
        "PH test on {} events: global chi2 {:.3} on {} df",
        d,
        global.statistic,
        p
    );

    let scaled_residuals = &r2 + &fit.coefficients().view().insert_axis(ndarray::Axis(0));
    Ok(PhTest {
        per_column,
        per_term,
        global,
        transform: config.transform,
        event_times,
        transformed_times: transformed,
        scaled_residuals,
    })
}

fn transform_times(
    transform: TimeTransform,
    event_times: &Array1<f64>,
    times: ArrayView1<f64>,
    events: &[bool],
) -> Array1<f64> {
    match transform {
        TimeTransform::Identity => event_times.clone(),
        TimeTransform::Log => event_times.mapv(f64::ln),
        TimeTransform::Rank => average_ranks(event_times),
        TimeTransform::KaplanMeier => {
            let km = kaplan_meier_before(times, events);
            event_times.mapv(|t| 1.0 - km(t))
        }
    }
}

/// 1-based ranks of sorted values, ties get their average rank
fn average_ranks(sorted: &Array1<f64>) -> Array1<f64> {
    let n = sorted.len();
    let mut ranks = Array1::zeros(n);
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && sorted[j + 1] == sorted[i] {
            j += 1;
        }
        let average = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[k] = average;
        }
        i = j + 1;
    }
    ranks
}

/// left-continuous Kaplan-Meier estimate S(t-) over the whole sample
fn kaplan_meier_before(times: ArrayView1<f64>, events: &[bool]) -> impl Fn(f64) -> f64 {
    let mut distinct: Vec<f64> = times
        .iter()
        .zip(events)
        .filter(|(_, &e)| e)
        .map(|(&t, _)| t)
        .collect();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();

    let mut steps = Vec::with_capacity(distinct.len());
    let mut survival = 1.0;
    for &t in &distinct {
        steps.push((t, survival));
        let at_risk = times.iter().filter(|&&s| s >= t).count() as f64;
        let deaths = times
            .iter()
            .zip(events)
            .filter(|(&s, &e)| e && s == t)
            .count() as f64;
        survival *= 1.0 - deaths / at_risk;
    }

    move |t: f64| {
        steps
            .iter()
            .rev()
            .find(|(s, _)| *s <= t)
            .map_or(1.0, |&(_, before)| before)
    }
}

fn correlation(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n = a.len() as f64;
    let (ma, mb) = (a.sum() / n, b.sum() / n);
    let mut sab = 0.0;
    let mut saa = 0.0;
    let mut sbb = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma).powi(2);
        sbb += (y - mb).powi(2);
    }
    if saa <= 0.0 || sbb <= 0.0 {
        return f64::NAN;
    }
    sab / (saa * sbb).sqrt()
}
