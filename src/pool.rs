// =============================================================================
// Rubin's Rules
// =============================================================================
//
// Combines m fits of the same formula on m imputed datasets:
//   - pooled coefficient = mean of the m estimates
//   - within variance W = mean of the m covariance matrices
//   - between variance B = sample covariance of the m estimates
//   - total variance T = W + (1 + 1/m) B
//
// Per-coefficient degrees of freedom follow Barnard & Rubin (1999), with the
// complete-data df taken as observations - coefficients. Multi-column tests
// use the D1 statistic with the Li, Raghunathan & Rubin (1991) denominator df.
//
// =============================================================================

use std::fmt;

use ndarray::{Array1, Array2};

use crate::convert::SpdFactor;
use crate::design::TermBlock;
use crate::error::{Result, SurvivalError};
use crate::inference::{confidence_interval_t, pvalue_f, pvalue_t, significance_stars};
use crate::model::FitResult;

/// coefficients and variance components after pooling
#[derive(Debug, Clone)]
pub struct PooledEstimate {
    coefficients: Array1<f64>,
    within: Array2<f64>,
    between: Array2<f64>,
    total: Array2<f64>,
    df: Array1<f64>,
    riv: Array1<f64>,
    fmi: Array1<f64>,
    m: usize,
    n_obs: usize,
    column_names: Vec<String>,
    blocks: Vec<TermBlock>,
}

/// D1 test of several pooled coefficients (F reference)
#[derive(Debug, Clone, PartialEq)]
pub struct PooledTest {
    pub label: String,
    pub statistic: f64,
    pub df1: f64,
    pub df2: f64,
    pub p_value: f64,
    /// average relative increase in variance
    pub riv: f64,
}

impl fmt::Display for PooledTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<24} {:>10.3} {:>5} {:>10.1} {:>10.4} {}",
            self.label,
            self.statistic,
            self.df1,
            self.df2,
            self.p_value,
            significance_stars(self.p_value)
        )
    }
}

/// Pool fits with Rubin's rules; any failed fit makes the whole pool degenerate.
pub fn pool_results(results: Vec<Result<FitResult>>) -> Result<PooledEstimate> {
    let fits = collect_fits(results)?;
    pool(&fits)
}

/// first failure wins, reported as a degenerate pool
pub(crate) fn collect_fits(results: Vec<Result<FitResult>>) -> Result<Vec<FitResult>> {
    results
        .into_iter()
        .enumerate()
        .map(|(i, r)| r.map_err(|e| SurvivalError::degenerate_fit(format!("fit {} failed: {}", i, e))))
        .collect()
}

/// Pool m fits of the same formula with Rubin's rules.
pub fn pool(fits: &[FitResult]) -> Result<PooledEstimate> {
    let first = fits
        .first()
        .ok_or_else(|| SurvivalError::degenerate_fit("nothing to pool (m = 0)"))?;
    for (i, fit) in fits.iter().enumerate().skip(1) {
        if fit.n_coefficients() != first.n_coefficients() {
            return Err(SurvivalError::degenerate_fit(format!(
                "fit {} has {} coefficients, fit 0 has {}",
                i,
                fit.n_coefficients(),
                first.n_coefficients()
            )));
        }
        if fit.column_names() != first.column_names() {
            return Err(SurvivalError::degenerate_fit(format!(
                "fit {} has different columns than fit 0",
                i
            )));
        }
        // same names can still hide different knots, levels or centres
        if fit.layout() != first.layout() {
            return Err(SurvivalError::degenerate_fit(format!(
                "fit {} was built with a different design layout than fit 0 - freeze knots before pooling",
                i
            )));
        }
    }

    let coefficients: Vec<&Array1<f64>> = fits.iter().map(FitResult::coefficients).collect();
    let covariances: Vec<&Array2<f64>> = fits.iter().map(FitResult::covariance).collect();
    let components = combine(&coefficients, &covariances);

    let m = fits.len();
    let p = first.n_coefficients();
    let n_obs = fits.iter().map(FitResult::n_obs).min().unwrap_or(0);
    let df_complete = n_obs as f64 - p as f64;

    let mf = m as f64;
    let mut df = Array1::zeros(p);
    let mut riv = Array1::zeros(p);
    let mut fmi = Array1::zeros(p);
    for j in 0..p {
        let w = components.within[[j, j]];
        let b = components.between[[j, j]];
        let t = components.total[[j, j]];
        riv[j] = if w > 0.0 { (1.0 + 1.0 / mf) * b / w } else { f64::NAN };
        df[j] = barnard_rubin_df(m, b, t, df_complete);
        fmi[j] = if df[j].is_infinite() {
            riv[j] / (riv[j] + 1.0)
        } else {
            (riv[j] + 2.0 / (df[j] + 3.0)) / (riv[j] + 1.0)
        };
    }

    log::info!("pooled {} fits of {} coefficients", m, p);

    Ok(PooledEstimate {
        coefficients: components.mean,
        within: components.within,
        between: components.between,
        total: components.total,
        df,
        riv,
        fmi,
        m,
        n_obs,
        column_names: first.column_names().to_vec(),
        blocks: first.blocks().to_vec(),
    })
}

struct Components {
    mean: Array1<f64>,
    within: Array2<f64>,
    between: Array2<f64>,
    total: Array2<f64>,
}

fn combine(coefficients: &[&Array1<f64>], covariances: &[&Array2<f64>]) -> Components {
    let m = coefficients.len();
    let p = coefficients[0].len();
    let mf = m as f64;

    let mut mean = Array1::<f64>::zeros(p);
    for beta in coefficients {
        mean += *beta;
    }
    mean /= mf;

    let mut within = Array2::<f64>::zeros((p, p));
    for cov in covariances {
        within += *cov;
    }
    within /= mf;

    // m = 1 leaves nothing to estimate the between part from
    let mut between = Array2::<f64>::zeros((p, p));
    if m > 1 {
        for beta in coefficients {
            let d = *beta - &mean;
            for a in 0..p {
                for b in 0..p {
                    between[[a, b]] += d[a] * d[b];
                }
            }
        }
        between /= mf - 1.0;
    }

    let total = &within + &(&between * (1.0 + 1.0 / mf));
    Components {
        mean,
        within,
        between,
        total,
    }
}

/// Barnard-Rubin small-sample df; infinite with one imputation, the observed-data df
/// when there is no between variance
fn barnard_rubin_df(m: usize, between: f64, total: f64, df_complete: f64) -> f64 {
    if m < 2 || total <= 0.0 {
        return f64::INFINITY;
    }
    let mf = m as f64;
    let lambda = ((1.0 + 1.0 / mf) * between / total).clamp(0.0, 1.0);
    let df_old = if lambda > 0.0 {
        (mf - 1.0) / (lambda * lambda)
    } else {
        f64::INFINITY
    };
    if df_complete <= 0.0 {
        return df_old;
    }
    let df_observed = (df_complete + 1.0) / (df_complete + 3.0) * df_complete * (1.0 - lambda);
    if df_observed <= 0.0 {
        return df_old;
    }
    1.0 / (1.0 / df_old + 1.0 / df_observed)
}

impl PooledEstimate {
    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    pub fn within(&self) -> &Array2<f64> {
        &self.within
    }

    pub fn between(&self) -> &Array2<f64> {
        &self.between
    }

    pub fn total(&self) -> &Array2<f64> {
        &self.total
    }

    /// Barnard-Rubin df per coefficient
    pub fn df(&self) -> &Array1<f64> {
        &self.df
    }

    /// relative increase in variance due to nonresponse
    pub fn riv(&self) -> &Array1<f64> {
        &self.riv
    }

    /// fraction of missing information
    pub fn fmi(&self) -> &Array1<f64> {
        &self.fmi
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn blocks(&self) -> &[TermBlock] {
        &self.blocks
    }

    pub fn hazard_ratios(&self) -> Array1<f64> {
        self.coefficients.mapv(f64::exp)
    }

    pub fn std_errors(&self) -> Array1<f64> {
        self.total.diag().mapv(f64::sqrt)
    }

    pub fn t_statistics(&self) -> Array1<f64> {
        &self.coefficients / &self.std_errors()
    }

    pub fn p_values(&self) -> Array1<f64> {
        let t = self.t_statistics();
        Array1::from_shape_fn(t.len(), |j| pvalue_t(t[j], self.df[j]))
    }

    pub fn confidence_intervals(&self, level: f64) -> Vec<(f64, f64)> {
        let se = self.std_errors();
        (0..self.coefficients.len())
            .map(|j| confidence_interval_t(self.coefficients[j], se[j], self.df[j], level))
            .collect()
    }

    /// D1 test over the columns of one term
    pub fn term_test(&self, label: &str) -> Result<PooledTest> {
        let block = self
            .blocks
            .iter()
            .find(|b| b.label == label)
            .ok_or_else(|| SurvivalError::formula(format!("no term `{}` in the pooled model", label)))?;
        self.test_columns(label, &block.columns.clone().collect::<Vec<_>>())
    }

    /// D1 multivariate Wald test with (1 + r) W as the covariance
    pub fn test_columns(&self, label: &str, columns: &[usize]) -> Result<PooledTest> {
        let k = columns.len();
        if k == 0 {
            return Err(SurvivalError::formula(format!("term `{}` has no columns to test", label)));
        }
        if columns.iter().any(|&j| j >= self.coefficients.len()) {
            return Err(SurvivalError::invalid_dimensions("column index out of bounds"));
        }
        let pick = |m: &Array2<f64>| Array2::from_shape_fn((k, k), |(a, b)| m[[columns[a], columns[b]]]);
        let beta = Array1::from_iter(columns.iter().map(|&j| self.coefficients[j]));
        let w = pick(&self.within);
        let b = pick(&self.between);

        let scale: Vec<f64> = w.diag().to_vec();
        let w_inv = SpdFactor::new(&w, &scale, 1e-12)
            .map_err(|j| SurvivalError::numerical_error(format!("within variance singular at column {}", j)))?
            .inverse();

        let mf = self.m as f64;
        let kf = k as f64;
        let r = (1.0 + 1.0 / mf) * b.dot(&w_inv).diag().sum() / kf;
        let statistic = beta.dot(&w_inv.dot(&beta)) / (kf * (1.0 + r));

        let t = kf * (mf - 1.0);
        let df2 = if self.m < 2 || r <= 0.0 {
            f64::INFINITY
        } else if t > 4.0 {
            4.0 + (t - 4.0) * (1.0 + (1.0 - 2.0 / t) / r).powi(2)
        } else {
            t * (1.0 + 1.0 / kf) * (1.0 + r).powi(2) / 2.0
        };

        Ok(PooledTest {
            label: label.to_string(),
            statistic,
            df1: kf,
            df2,
            p_value: pvalue_f(statistic, kf, df2),
            riv: r,
        })
    }

    pub fn summary(&self) -> PooledSummary<'_> {
        PooledSummary { pooled: self }
    }
}

/// printable coefficient table for a pooled fit
pub struct PooledSummary<'a> {
    pooled: &'a PooledEstimate,
}

impl PooledSummary<'_> {
    pub fn print(&self) {
        println!("{}", self);
    }
}

impl fmt::Display for PooledSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pooled = self.pooled;
        writeln!(f, "pooled cox model (m = {}, n = {})", pooled.m, pooled.n_obs)?;
        writeln!(f, "=====================================")?;
        writeln!(
            f,
            "{:<24} {:>10} {:>10} {:>10} {:>8} {:>9} {:>10} {:>7}",
            "term", "coef", "exp(coef)", "se", "t", "df", "p", "fmi"
        )?;
        writeln!(f, "{:-<95}", "")?;

        let (se, t, p) = (pooled.std_errors(), pooled.t_statistics(), pooled.p_values());
        for (j, name) in pooled.column_names.iter().enumerate() {
            writeln!(
                f,
                "{:<24} {:>10.4} {:>10.4} {:>10.4} {:>8.3} {:>9.1} {:>10.4} {:>7.3} {}",
                name,
                pooled.coefficients[j],
                pooled.coefficients[j].exp(),
                se[j],
                t[j],
                pooled.df[j],
                p[j],
                pooled.fmi[j],
                significance_stars(p[j])
            )?;
        }

        let multi: Vec<PooledTest> = pooled
            .blocks
            .iter()
            .filter(|b| b.width() > 1)
            .filter_map(|b| pooled.term_test(&b.label).ok())
            .collect();
        if !multi.is_empty() {
            writeln!(f)?;
            writeln!(f, "{:<24} {:>10} {:>5} {:>10} {:>10}", "term D1 tests", "F", "df1", "df2", "p")?;
            for test in &multi {
                writeln!(f, "{}", test)?;
            }
        }
        Ok(())
    }
}
