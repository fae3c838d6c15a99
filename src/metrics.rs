use ndarray::{Array1, ArrayView1};

use crate::design::DesignMatrix;
use crate::error::{Result, SurvivalError};
use crate::model::FitResult;

/// Harrell's C-index: how often does higher risk mean shorter survival?
///
/// Pairs are comparable when the earlier time is an event; tied risk scores
/// count one half. With `strata`, only pairs within the same stratum count.
pub fn harrell_c_index(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: &[bool],
    strata: Option<&[usize]>,
) -> Result<f64> {
    let n = risk_scores.len();
    if n != times.len() || n != events.len() || strata.map_or(false, |s| s.len() != n) {
        return Err(SurvivalError::invalid_dimensions(
            "risk scores, times, events and strata must have same length",
        ));
    }
    if n < 2 {
        return Err(SurvivalError::invalid_dimensions("need at least 2 samples for concordance"));
    }

    let same_stratum = |i: usize, j: usize| strata.map_or(true, |s| s[i] == s[j]);

    let mut concordant = 0.0;
    let mut discordant = 0.0;
    let mut tied_risk = 0.0;

    for i in 0..n {
        if !events[i] {
            continue;
        }

        for j in 0..n {
            if i == j || !same_stratum(i, j) {
                continue;
            }

            // j outlived i (event later, or censored no earlier)
            if times[j] > times[i] || (!events[j] && times[j] >= times[i]) {
                if risk_scores[i] > risk_scores[j] {
                    concordant += 1.0;
                } else if risk_scores[i] < risk_scores[j] {
                    discordant += 1.0;
                } else {
                    tied_risk += 1.0;
                }
            }
        }
    }

    let total_pairs = concordant + discordant + tied_risk;
    if total_pairs == 0.0 {
        return Err(SurvivalError::numerical_error("no comparable pairs for C-index calculation"));
    }

    Ok((concordant + 0.5 * tied_risk) / total_pairs)
}

/// AIC (Akaike Information Criterion) for Cox model
pub fn aic(log_likelihood: f64, n_parameters: usize) -> f64 {
    2.0 * n_parameters as f64 - 2.0 * log_likelihood
}

/// BIC with the number of events as the effective sample size
pub fn bic(log_likelihood: f64, n_parameters: usize, n_events: usize) -> f64 {
    (n_parameters as f64) * (n_events as f64).ln() - 2.0 * log_likelihood
}

/// Comprehensive model evaluation metrics
#[derive(Debug, Clone)]
pub struct ModelMetrics {
    pub c_index: f64,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    /// Nagelkerke-style R² from the likelihood ratio
    pub r_squared: f64,
}

impl ModelMetrics {
    /// Compute all metrics for a fitted Cox model on the design it was fit to
    pub fn compute(fit: &FitResult, design: &DesignMatrix) -> Result<Self> {
        if design.n_columns() != fit.n_coefficients() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "design has {} columns, fit has {} coefficients",
                design.n_columns(),
                fit.n_coefficients()
            )));
        }
        let risk_scores: Array1<f64> = design.x().dot(fit.coefficients());
        let c_index = harrell_c_index(risk_scores.view(), design.times(), design.events(), design.strata())?;

        let p = fit.n_coefficients();
        let n = fit.n_obs() as f64;
        let lr = 2.0 * (fit.loglik() - fit.loglik_null());
        let max_r2 = 1.0 - (2.0 * fit.loglik_null() / n).exp();
        let r_squared = if max_r2 > 0.0 {
            (1.0 - (-lr / n).exp()) / max_r2
        } else {
            f64::NAN
        };

        Ok(Self {
            c_index,
            log_likelihood: fit.loglik(),
            aic: aic(fit.loglik(), p),
            bic: bic(fit.loglik(), p, fit.n_events()),
            r_squared,
        })
    }

    /// Print metrics summary
    pub fn print(&self) {
        println!("model evaluation metrics");
        println!("========================");
        println!("C-index:             {:.6}", self.c_index);
        println!("log-likelihood:      {:.6}", self.log_likelihood);
        println!("AIC:                 {:.6}", self.aic);
        println!("BIC:                 {:.6}", self.bic);
        println!("R² (Nagelkerke):     {:.6}", self.r_squared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CoxModel, SurvivalRegression};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_perfect_concordance() {
        let times = Array1::from(vec![1.0, 2.0, 3.0, 4.0]);
        let events = vec![true, true, true, true];
        // perfectly anti-correlated with time
        let risk_scores = Array1::from(vec![4.0, 3.0, 2.0, 1.0]);

        let c_index = harrell_c_index(risk_scores.view(), times.view(), &events, None).unwrap();
        assert_relative_eq!(c_index, 1.0, epsilon = 1e-10);

        let reversed = risk_scores.mapv(|r| -r);
        let c_index = harrell_c_index(reversed.view(), times.view(), &events, None).unwrap();
        assert_relative_eq!(c_index, 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_tied_scores_count_half() {
        let times = Array1::from(vec![1.0, 2.0, 3.0]);
        let events = vec![true, true, false];
        let risk_scores = Array1::from(vec![1.0, 1.0, 1.0]);
        let c_index = harrell_c_index(risk_scores.view(), times.view(), &events, None).unwrap();
        assert_relative_eq!(c_index, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_strata_restrict_pairs() {
        let times = Array1::from(vec![1.0, 2.0, 1.0, 2.0]);
        let events = vec![true, true, true, true];
        let risk_scores = Array1::from(vec![2.0, 1.0, 0.0, -1.0]);
        // across strata (0 vs 3) would add a concordant pair, (2 vs 1) a discordant one
        let strata = [0, 0, 1, 1];
        let c_index = harrell_c_index(risk_scores.view(), times.view(), &events, Some(&strata)).unwrap();
        assert_relative_eq!(c_index, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dimension_mismatch_error() {
        let risk_scores = Array1::from(vec![1.0, 2.0]);
        let times = Array1::from(vec![1.0, 2.0, 3.0]);
        let events = vec![true, false];

        assert!(harrell_c_index(risk_scores.view(), times.view(), &events, None).is_err());
    }

    #[test]
    fn test_aic_bic() {
        let log_likelihood = -10.0;
        let aic_score = aic(log_likelihood, 3);
        let bic_score = bic(log_likelihood, 3, 100);

        assert_relative_eq!(aic_score, 26.0);
        assert!(bic_score > aic_score);
    }

    #[test]
    fn test_model_metrics() {
        let x = Array2::from_shape_vec((6, 1), vec![2.0, -0.5, 0.3, 1.0, 1.5, -1.0]).unwrap();
        let design = DesignMatrix::from_matrix(
            x,
            None,
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            vec![true, true, false, true, true, false],
            None,
        )
        .unwrap();
        let fit = CoxModel::new().fit_design(&design).unwrap();
        let metrics = ModelMetrics::compute(&fit, &design).unwrap();

        assert!(metrics.c_index > 0.5 && metrics.c_index <= 1.0);
        assert_relative_eq!(metrics.log_likelihood, fit.loglik());
        assert!(metrics.aic > 0.0);
        assert!((0.0..=1.0).contains(&metrics.r_squared));
    }
}
