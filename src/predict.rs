//! Prediction with an explicit data distribution.
//!
//! A [`DataDistribution`] records the adjust-to value of every covariate
//! (median for continuous, reference level for categorical) and the
//! quartiles used for default contrasts. It is passed to every call that
//! needs to fill in covariates the caller didn't set; nothing is global.

use std::collections::{BTreeMap, HashMap};

use ndarray::Array1;

use crate::data::{Column, CovariateKind, Dataset, Value};
use crate::error::{Result, SurvivalError};
use crate::inference::z_critical;
use crate::model::FitResult;
use crate::spline::quantile_sorted;

/// adjust-to values and quartiles per covariate
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataDistribution {
    adjust_to: BTreeMap<String, Value>,
    quartiles: BTreeMap<String, (f64, f64)>,
}

impl DataDistribution {
    /// summarise the observed (non-missing) values of every covariate
    pub fn from_dataset(dataset: &Dataset) -> Result<Self> {
        let mut dist = Self::default();
        for (spec, column) in dataset.specs().iter().zip(dataset.columns()) {
            match (&spec.kind, column) {
                (CovariateKind::Continuous, Column::Continuous(values)) => {
                    let mut observed: Vec<f64> = values.iter().flatten().copied().collect();
                    if observed.is_empty() {
                        return Err(SurvivalError::schema(format!(
                            "`{}` has no observed values to summarise",
                            spec.name
                        )));
                    }
                    observed.sort_by(f64::total_cmp);
                    dist.adjust_to
                        .insert(spec.name.clone(), Value::Numeric(quantile_sorted(&observed, 0.5)));
                    dist.quartiles.insert(
                        spec.name.clone(),
                        (quantile_sorted(&observed, 0.25), quantile_sorted(&observed, 0.75)),
                    );
                }
                (_, _) => {
                    let reference = spec.reference_level().ok_or_else(|| {
                        SurvivalError::schema(format!("`{}` has no levels", spec.name))
                    })?;
                    dist.adjust_to
                        .insert(spec.name.clone(), Value::category(reference));
                }
            }
        }
        Ok(dist)
    }

    pub fn adjust_to(&self, variable: &str) -> Option<&Value> {
        self.adjust_to.get(variable)
    }

    /// override the adjust-to value of one covariate
    pub fn with_adjust_to(mut self, variable: impl Into<String>, value: Value) -> Self {
        self.adjust_to.insert(variable.into(), value);
        self
    }

    /// (25th, 75th) percentile of a continuous covariate
    pub fn quartiles(&self, variable: &str) -> Option<(f64, f64)> {
        self.quartiles.get(variable).copied()
    }

    /// caller's values with every other covariate at its adjust-to value
    pub fn complete(&self, fit: &FitResult, values: &HashMap<String, Value>) -> Result<HashMap<String, Value>> {
        fit.layout()
            .variables()
            .iter()
            .map(|spec| {
                let value = values
                    .get(&spec.name)
                    .filter(|v| !v.is_missing())
                    .or_else(|| self.adjust_to.get(&spec.name))
                    .cloned()
                    .ok_or_else(|| {
                        SurvivalError::schema(format!(
                            "no value or adjust-to setting for `{}`",
                            spec.name
                        ))
                    })?;
                Ok((spec.name.clone(), value))
            })
            .collect()
    }
}

/// (x - means) · beta for one subject, other covariates at their adjust-to values
pub fn linear_predictor(fit: &FitResult, dist: &DataDistribution, values: &HashMap<String, Value>) -> Result<f64> {
    let row = encode_centred(fit, dist, values)?;
    Ok(row.dot(fit.coefficients()))
}

/// exp of the linear predictor relative to the covariate means
pub fn relative_hazard(fit: &FitResult, dist: &DataDistribution, values: &HashMap<String, Value>) -> Result<f64> {
    linear_predictor(fit, dist, values).map(f64::exp)
}

fn encode_centred(fit: &FitResult, dist: &DataDistribution, values: &HashMap<String, Value>) -> Result<Array1<f64>> {
    let completed = dist.complete(fit, values)?;
    let row = fit.layout().encode(&completed)?;
    Ok(row - fit.means())
}

/// log relative hazard along one covariate, relative to the adjust-to row
#[derive(Debug, Clone)]
pub struct EffectCurve {
    pub variable: String,
    pub values: Vec<Value>,
    pub log_relative_hazard: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

/// Vary `variable` over `grid` with everything else held at its adjust-to value.
pub fn partial_effect(
    fit: &FitResult,
    dist: &DataDistribution,
    variable: &str,
    grid: &[Value],
    confidence: f64,
) -> Result<EffectCurve> {
    if !fit.layout().variables().iter().any(|s| s.name == variable) {
        return Err(SurvivalError::formula(format!("`{}` isn't in the fitted model", variable)));
    }
    let reference = encode_centred(fit, dist, &HashMap::new())?;
    let z = z_critical(confidence);

    let mut curve = EffectCurve {
        variable: variable.to_string(),
        values: grid.to_vec(),
        log_relative_hazard: Vec::with_capacity(grid.len()),
        lower: Vec::with_capacity(grid.len()),
        upper: Vec::with_capacity(grid.len()),
    };
    for value in grid {
        let values = HashMap::from([(variable.to_string(), value.clone())]);
        let contrast = encode_centred(fit, dist, &values)? - &reference;
        let estimate = contrast.dot(fit.coefficients());
        let se = contrast.dot(&fit.covariance().dot(&contrast)).max(0.0).sqrt();
        curve.log_relative_hazard.push(estimate);
        curve.lower.push(estimate - z * se);
        curve.upper.push(estimate + z * se);
    }
    Ok(curve)
}

/// hazard ratio between two settings of one covariate
#[derive(Debug, Clone, PartialEq)]
pub struct Contrast {
    pub variable: String,
    pub log_hazard_ratio: f64,
    pub std_error: f64,
    pub hazard_ratio: f64,
    pub lower: f64,
    pub upper: f64,
}

/// hazard ratio of `to` versus `from` with other covariates at their adjust-to values
pub fn hazard_ratio(
    fit: &FitResult,
    dist: &DataDistribution,
    variable: &str,
    from: Value,
    to: Value,
    confidence: f64,
) -> Result<Contrast> {
    let curve = partial_effect(fit, dist, variable, &[from, to], confidence)?;
    let log_hr = curve.log_relative_hazard[1] - curve.log_relative_hazard[0];

    let completed_from = HashMap::from([(variable.to_string(), curve.values[0].clone())]);
    let completed_to = HashMap::from([(variable.to_string(), curve.values[1].clone())]);
    let contrast = encode_centred(fit, dist, &completed_to)? - encode_centred(fit, dist, &completed_from)?;
    let se = contrast.dot(&fit.covariance().dot(&contrast)).max(0.0).sqrt();
    let z = z_critical(confidence);

    Ok(Contrast {
        variable: variable.to_string(),
        log_hazard_ratio: log_hr,
        std_error: se,
        hazard_ratio: log_hr.exp(),
        lower: (log_hr - z * se).exp(),
        upper: (log_hr + z * se).exp(),
    })
}

/// inter-quartile hazard ratio for a continuous covariate
pub fn interquartile_hazard_ratio(
    fit: &FitResult,
    dist: &DataDistribution,
    variable: &str,
    confidence: f64,
) -> Result<Contrast> {
    let (q1, q3) = dist.quartiles(variable).ok_or_else(|| {
        SurvivalError::schema(format!("`{}` has no quartiles - is it continuous?", variable))
    })?;
    hazard_ratio(fit, dist, variable, Value::Numeric(q1), Value::Numeric(q3), confidence)
}

/// cumulative baseline hazard of one stratum (at the covariate means)
#[derive(Debug, Clone, PartialEq)]
pub struct StratumHazard {
    pub label: String,
    pub times: Vec<f64>,
    pub cumulative: Vec<f64>,
}

impl StratumHazard {
    /// right-continuous step function, 0 before the first event
    pub fn at(&self, t: f64) -> f64 {
        match self.times.partition_point(|&s| s <= t) {
            0 => 0.0,
            k => self.cumulative[k - 1],
        }
    }
}

/// Breslow (or Efron) estimate of the baseline cumulative hazard per stratum
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineHazard {
    strata: Vec<StratumHazard>,
}

impl BaselineHazard {
    pub fn from_fit(fit: &FitResult) -> Self {
        let increments = fit.baseline_increments();
        let n_strata = increments
            .iter()
            .map(|h| h.stratum + 1)
            .max()
            .unwrap_or(0)
            .max(fit.strata_labels().len())
            .max(1);

        let mut strata: Vec<StratumHazard> = (0..n_strata)
            .map(|s| StratumHazard {
                label: fit
                    .strata_labels()
                    .get(s)
                    .cloned()
                    .unwrap_or_else(|| "all".to_string()),
                times: Vec::new(),
                cumulative: Vec::new(),
            })
            .collect();

        // increments come in increasing time order within each stratum
        for h in increments {
            let stratum = &mut strata[h.stratum];
            let previous = stratum.cumulative.last().copied().unwrap_or(0.0);
            stratum.times.push(h.time);
            stratum.cumulative.push(previous + h.increment);
        }
        Self { strata }
    }

    pub fn n_strata(&self) -> usize {
        self.strata.len()
    }

    pub fn strata(&self) -> &[StratumHazard] {
        &self.strata
    }

    pub fn stratum(&self, label: &str) -> Option<&StratumHazard> {
        self.strata.iter().find(|s| s.label == label)
    }
}

/// Predicted survival probabilities at `times` for one subject.
pub fn survival_curve(
    fit: &FitResult,
    dist: &DataDistribution,
    values: &HashMap<String, Value>,
    times: &[f64],
) -> Result<Vec<f64>> {
    let baseline = BaselineHazard::from_fit(fit);
    let stratum = select_stratum(fit, dist, values, &baseline)?;
    let risk = relative_hazard(fit, dist, values)?;
    Ok(times.iter().map(|&t| (-stratum.at(t) * risk).exp()).collect())
}

fn select_stratum<'a>(
    fit: &FitResult,
    dist: &DataDistribution,
    values: &HashMap<String, Value>,
    baseline: &'a BaselineHazard,
) -> Result<&'a StratumHazard> {
    let variables = fit.layout().strata_variables();
    if variables.is_empty() {
        return baseline
            .strata()
            .first()
            .ok_or_else(|| SurvivalError::schema("fit has no baseline hazard"));
    }

    let mut parts = Vec::with_capacity(variables.len());
    for (variable, _) in variables {
        let level = match values.get(variable).or_else(|| dist.adjust_to(variable)) {
            Some(Value::Category(level)) => level.clone(),
            _ => {
                return Err(SurvivalError::schema(format!(
                    "a level of stratum `{}` is needed for survival curves",
                    variable
                )))
            }
        };
        parts.push(format!("{}={}", variable, level));
    }
    let label = parts.join(", ");
    baseline
        .stratum(&label)
        .ok_or_else(|| SurvivalError::schema(format!("no stratum `{}` in the fitted data", label)))
}
