use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SurvivalError};

/// outer knot quantiles
const LOWER_KNOT_QUANTILE: f64 = 0.05;
const UPPER_KNOT_QUANTILE: f64 = 0.95;

/// Restricted cubic spline with Harrell's parameterisation: one linear column
/// plus `k - 2` truncated-power columns, linear beyond the outer knots and
/// scaled by `(t_k - t_1)^2` so the nonlinear columns stay on the data's scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictedCubicSpline {
    knots: Vec<f64>,
}

impl RestrictedCubicSpline {
    /// spline over explicit knots (at least 3, strictly increasing)
    pub fn new(knots: Vec<f64>) -> Result<Self> {
        if knots.len() < 3 {
            return Err(SurvivalError::formula(format!(
                "restricted cubic splines need at least 3 knots, got {}",
                knots.len()
            )));
        }
        if knots.iter().any(|k| !k.is_finite()) || knots.windows(2).any(|w| w[0] >= w[1]) {
            return Err(SurvivalError::formula(format!(
                "knots must be finite and strictly increasing: {:?}",
                knots
            )));
        }
        Ok(Self { knots })
    }

    /// place `k` knots at quantiles of the observed values
    pub fn from_data(values: &[f64], k: usize, label: &str) -> Result<Self> {
        let knots = place_knots(values, k, label)?;
        Self::new(knots)
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    /// linear column + (k - 2) nonlinear columns
    pub fn n_columns(&self) -> usize {
        self.knots.len() - 1
    }

    /// basis row for a single value
    pub fn evaluate(&self, x: f64) -> Vec<f64> {
        let t = &self.knots;
        let k = t.len();
        let (t_last, t_penult) = (t[k - 1], t[k - 2]);
        let norm = (t_last - t[0]).powi(2);
        let tail = t_last - t_penult;

        let mut row = Vec::with_capacity(k - 1);
        row.push(x);
        for &t_j in &t[..k - 2] {
            let value = cube_plus(x - t_j)
                - cube_plus(x - t_penult) * (t_last - t_j) / tail
                + cube_plus(x - t_last) * (t_penult - t_j) / tail;
            row.push(value / norm);
        }
        row
    }

    /// basis matrix (n x (k - 1))
    pub fn basis(&self, values: ArrayView1<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((values.len(), self.n_columns()));
        for (i, &x) in values.iter().enumerate() {
            for (j, v) in self.evaluate(x).into_iter().enumerate() {
                out[[i, j]] = v;
            }
        }
        out
    }

    /// `age`, `age'`, `age''`, ...
    pub fn column_names(&self, variable: &str) -> Vec<String> {
        (0..self.n_columns())
            .map(|j| format!("{}{}", variable, "'".repeat(j)))
            .collect()
    }
}

fn cube_plus(x: f64) -> f64 {
    if x > 0.0 {
        x * x * x
    } else {
        0.0
    }
}

/// 0.05, evenly spaced interior quantiles, 0.95
pub fn knot_quantiles(k: usize) -> Vec<f64> {
    match k {
        0 => vec![],
        1 => vec![0.5],
        _ => {
            let step = (UPPER_KNOT_QUANTILE - LOWER_KNOT_QUANTILE) / (k - 1) as f64;
            (0..k)
                .map(|i| LOWER_KNOT_QUANTILE + step * i as f64)
                .collect()
        }
    }
}

/// Quantile of already-sorted data with linear interpolation (type 7 in R).
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let float_idx = (n as f64 - 1.0) * p.clamp(0.0, 1.0);
    let lower_idx = float_idx.floor() as usize;
    let upper_idx = float_idx.ceil() as usize;

    if lower_idx == upper_idx {
        sorted[lower_idx]
    } else {
        let fraction = float_idx - lower_idx as f64;
        sorted[lower_idx] * (1.0 - fraction) + sorted[upper_idx] * fraction
    }
}

/// Knot locations for a `k`-knot spline from the observed values.
///
/// Fails with `InsufficientData` when fewer than `k` distinct values are
/// observed, or when heavy ties collapse two quantiles onto the same value.
pub fn place_knots(values: &[f64], k: usize, label: &str) -> Result<Vec<f64>> {
    if k < 3 {
        return Err(SurvivalError::formula(format!(
            "{} asks for {} knots - restricted cubic splines need at least 3",
            label, k
        )));
    }

    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut distinct = sorted.clone();
    distinct.dedup();
    if distinct.len() < k {
        return Err(SurvivalError::insufficient_data(label, k, distinct.len()));
    }

    let mut knots: Vec<f64> = knot_quantiles(k)
        .into_iter()
        .map(|p| quantile_sorted(&sorted, p))
        .collect();
    knots.dedup();
    if knots.len() < k {
        return Err(SurvivalError::insufficient_data(label, k, knots.len()));
    }
    Ok(knots)
}
