use std::fmt;

use ndarray::{Array1, Array2, ArrayView1};

use crate::convert::SpdFactor;
use crate::design::{DesignLayout, DesignMatrix, TermBlock};
use crate::error::{Result, SurvivalError};
use crate::inference::{confidence_interval_z, pvalue_chi2, pvalue_z, significance_stars};
use crate::optimization::{
    CancellationToken, CoxOptimizer, HazardIncrement, OptimizationConfig, PartialLikelihood, TieMethod,
};

/// A survival regression solver. Only the Cox model implements it today.
pub trait SurvivalRegression {
    /// fit on a design matrix with explicitly supplied outcome and strata
    fn fit(
        &self,
        design: &DesignMatrix,
        times: ArrayView1<f64>,
        events: &[bool],
        strata: Option<&[usize]>,
    ) -> Result<FitResult>;

    /// fit using the outcome and strata the design was built with
    fn fit_design(&self, design: &DesignMatrix) -> Result<FitResult> {
        self.fit(design, design.times(), design.events(), design.strata())
    }
}

/// cox proportional hazards model
#[derive(Debug, Clone, Default)]
pub struct CoxModel {
    config: OptimizationConfig,
    cancel: Option<CancellationToken>,
}

impl CoxModel {
    /// new cox model w/ defaults (efron ties, 25 iterations)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: OptimizationConfig) -> Self {
        Self { config, cancel: None }
    }

    pub fn with_ties(mut self, ties: TieMethod) -> Self {
        self.config.ties = ties;
        self
    }

    /// max newton iterations before giving up
    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.config.max_iterations = max_iter;
        self
    }

    /// how close is close enough for convergence
    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.config.tolerance = tol;
        self
    }

    pub fn with_singularity_tolerance(mut self, tol: f64) -> Self {
        self.config.singularity_tolerance = tol;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    fn optimizer(&self) -> CoxOptimizer {
        let optimizer = CoxOptimizer::new(self.config.clone());
        match &self.cancel {
            Some(token) => optimizer.with_cancellation(token.clone()),
            None => optimizer,
        }
    }

    /// Likelihood-ratio test for one term: refit without its columns and
    /// compare log-likelihoods.
    pub fn term_likelihood_ratio_test(
        &self,
        fit: &FitResult,
        design: &DesignMatrix,
        label: &str,
    ) -> Result<ChiSquareTest> {
        let block = fit
            .blocks()
            .iter()
            .find(|b| b.label == label)
            .ok_or_else(|| SurvivalError::formula(format!("no term `{}` in the fitted model", label)))?;
        if block.width() == 0 {
            return Err(SurvivalError::formula(format!("term `{}` has no columns to test", label)));
        }

        let kept: Vec<usize> = (0..design.n_columns()).filter(|j| !block.columns.contains(j)).collect();
        let reduced_loglik = if kept.is_empty() {
            fit.loglik_null()
        } else {
            let reduced = design.select_columns(&kept)?;
            self.fit_design(&reduced)?.loglik()
        };

        let statistic = (2.0 * (fit.loglik() - reduced_loglik)).max(0.0);
        let df = block.width() as f64;
        Ok(ChiSquareTest {
            label: label.to_string(),
            statistic,
            df,
            p_value: pvalue_chi2(statistic, df),
        })
    }
}

impl SurvivalRegression for CoxModel {
    fn fit(
        &self,
        design: &DesignMatrix,
        times: ArrayView1<f64>,
        events: &[bool],
        strata: Option<&[usize]>,
    ) -> Result<FitResult> {
        let problem = PartialLikelihood::new(design.x(), times, events, strata)?;
        let outcome = self.optimizer().optimize(&problem, design.column_names())?;
        let baseline = problem.hazard_increments(&outcome.coefficients, self.config.ties);

        Ok(FitResult {
            coefficients: outcome.coefficients,
            covariance: outcome.covariance,
            information: outcome.information,
            loglik_null: outcome.loglik_null,
            loglik: outcome.loglik,
            score_statistic: outcome.score_statistic,
            n_events: problem.n_events(),
            n_obs: problem.n_samples(),
            iterations: outcome.iterations,
            ties: self.config.ties,
            means: outcome.means,
            layout: design.layout().clone(),
            strata_labels: design.strata_labels().to_vec(),
            baseline,
        })
    }
}

/// chi-square test of one or more coefficients
#[derive(Debug, Clone, PartialEq)]
pub struct ChiSquareTest {
    pub label: String,
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
}

impl fmt::Display for ChiSquareTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<24} {:>10.3} {:>5} {:>10.4} {}",
            self.label,
            self.statistic,
            self.df,
            self.p_value,
            significance_stars(self.p_value)
        )
    }
}

/// Wald statistic βᵀ V⁻¹ β for a coefficient sub-vector
pub(crate) fn wald_statistic(beta: &Array1<f64>, covariance: &Array2<f64>) -> Result<f64> {
    let scale: Vec<f64> = covariance.diag().to_vec();
    let factor = SpdFactor::new(covariance, &scale, 1e-12).map_err(|j| {
        SurvivalError::numerical_error(format!("covariance block is singular at column {}", j))
    })?;
    Ok(beta.dot(&factor.solve(beta)))
}

/// A converged Cox fit. Immutable once returned.
#[derive(Debug, Clone)]
pub struct FitResult {
    coefficients: Array1<f64>,
    covariance: Array2<f64>,
    information: Array2<f64>,
    loglik_null: f64,
    loglik: f64,
    score_statistic: f64,
    n_events: usize,
    n_obs: usize,
    iterations: usize,
    ties: TieMethod,
    means: Array1<f64>,
    layout: DesignLayout,
    strata_labels: Vec<String>,
    baseline: Vec<HazardIncrement>,
}

impl FitResult {
    /// the betas
    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    pub fn information(&self) -> &Array2<f64> {
        &self.information
    }

    pub fn loglik_null(&self) -> f64 {
        self.loglik_null
    }

    pub fn loglik(&self) -> f64 {
        self.loglik
    }

    pub fn n_events(&self) -> usize {
        self.n_events
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn n_coefficients(&self) -> usize {
        self.coefficients.len()
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn ties(&self) -> TieMethod {
        self.ties
    }

    pub fn column_names(&self) -> &[String] {
        self.layout.column_names()
    }

    pub fn blocks(&self) -> &[TermBlock] {
        self.layout.blocks()
    }

    /// frozen encoding used to build the fitted design
    pub fn layout(&self) -> &DesignLayout {
        &self.layout
    }

    /// covariate means the baseline hazard refers to
    pub fn means(&self) -> &Array1<f64> {
        &self.means
    }

    pub fn strata_labels(&self) -> &[String] {
        &self.strata_labels
    }

    pub(crate) fn baseline_increments(&self) -> &[HazardIncrement] {
        &self.baseline
    }

    /// exp(beta)
    pub fn hazard_ratios(&self) -> Array1<f64> {
        self.coefficients.mapv(f64::exp)
    }

    pub fn std_errors(&self) -> Array1<f64> {
        self.covariance.diag().mapv(f64::sqrt)
    }

    pub fn z_scores(&self) -> Array1<f64> {
        &self.coefficients / &self.std_errors()
    }

    /// two-sided wald p-values
    pub fn p_values(&self) -> Array1<f64> {
        self.z_scores().mapv(pvalue_z)
    }

    /// (lower, upper) for each beta
    pub fn confidence_intervals(&self, level: f64) -> Vec<(f64, f64)> {
        self.coefficients
            .iter()
            .zip(self.std_errors().iter())
            .map(|(&b, &se)| confidence_interval_z(b, se, level))
            .collect()
    }

    /// intervals on the hazard-ratio scale
    pub fn hazard_ratio_intervals(&self, level: f64) -> Vec<(f64, f64)> {
        self.confidence_intervals(level)
            .into_iter()
            .map(|(lo, hi)| (lo.exp(), hi.exp()))
            .collect()
    }

    /// Wald chi-square over the columns of one term block.
    pub fn term_wald_test(&self, label: &str) -> Result<ChiSquareTest> {
        let block = self
            .layout
            .block(label)
            .ok_or_else(|| SurvivalError::formula(format!("no term `{}` in the fitted model", label)))?;
        self.wald_test_columns(label, &block.columns.clone().collect::<Vec<_>>())
    }

    /// Wald chi-square for an arbitrary set of columns
    pub fn wald_test_columns(&self, label: &str, columns: &[usize]) -> Result<ChiSquareTest> {
        if columns.is_empty() {
            return Err(SurvivalError::formula(format!("term `{}` has no columns to test", label)));
        }
        if columns.iter().any(|&j| j >= self.n_coefficients()) {
            return Err(SurvivalError::invalid_dimensions("column index out of bounds"));
        }
        let beta = Array1::from_iter(columns.iter().map(|&j| self.coefficients[j]));
        let cov = Array2::from_shape_fn((columns.len(), columns.len()), |(a, b)| {
            self.covariance[[columns[a], columns[b]]]
        });
        let statistic = wald_statistic(&beta, &cov)?;
        let df = columns.len() as f64;
        Ok(ChiSquareTest {
            label: label.to_string(),
            statistic,
            df,
            p_value: pvalue_chi2(statistic, df),
        })
    }

    /// one Wald test per term block that owns columns, in formula order
    pub fn term_wald_tests(&self) -> Result<Vec<ChiSquareTest>> {
        self.blocks()
            .iter()
            .filter(|b| b.width() > 0)
            .map(|b| self.term_wald_test(&b.label))
            .collect()
    }

    /// 2 (loglik - loglik_null)
    pub fn likelihood_ratio_test(&self) -> ChiSquareTest {
        let statistic = (2.0 * (self.loglik - self.loglik_null)).max(0.0);
        let df = self.n_coefficients() as f64;
        ChiSquareTest {
            label: "likelihood ratio".into(),
            statistic,
            df,
            p_value: pvalue_chi2(statistic, df),
        }
    }

    /// βᵀ I β at the solution
    pub fn wald_test(&self) -> ChiSquareTest {
        let statistic = self.coefficients.dot(&self.information.dot(&self.coefficients));
        let df = self.n_coefficients() as f64;
        ChiSquareTest {
            label: "wald".into(),
            statistic,
            df,
            p_value: pvalue_chi2(statistic, df),
        }
    }

    /// score (log-rank) test of beta = 0
    pub fn score_test(&self) -> ChiSquareTest {
        let df = self.n_coefficients() as f64;
        ChiSquareTest {
            label: "score".into(),
            statistic: self.score_statistic,
            df,
            p_value: pvalue_chi2(self.score_statistic, df),
        }
    }

    /// get a nice summary of the fitted model
    pub fn summary(&self) -> FitSummary {
        let confidence = 0.95;
        let intervals = self.hazard_ratio_intervals(confidence);
        let (z, p, se) = (self.z_scores(), self.p_values(), self.std_errors());
        let rows = (0..self.n_coefficients())
            .map(|j| CoefficientRow {
                name: self.column_names()[j].clone(),
                coefficient: self.coefficients[j],
                hazard_ratio: self.coefficients[j].exp(),
                std_error: se[j],
                z: z[j],
                p_value: p[j],
                lower: intervals[j].0,
                upper: intervals[j].1,
            })
            .collect();

        FitSummary {
            rows,
            // a singular sub-block only loses its own line
            term_tests: self
                .blocks()
                .iter()
                .filter(|b| b.width() > 1)
                .filter_map(|b| self.term_wald_test(&b.label).ok())
                .collect(),
            global_tests: vec![self.likelihood_ratio_test(), self.wald_test(), self.score_test()],
            n_obs: self.n_obs,
            n_events: self.n_events,
            iterations: self.iterations,
            ties: self.ties,
            confidence,
            strata: self.strata_labels.clone(),
        }
    }
}

/// one line of the coefficient table
#[derive(Debug, Clone)]
pub struct CoefficientRow {
    pub name: String,
    pub coefficient: f64,
    pub hazard_ratio: f64,
    pub std_error: f64,
    pub z: f64,
    pub p_value: f64,
    pub lower: f64,
    pub upper: f64,
}

/// nice summary of what the model learned
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub rows: Vec<CoefficientRow>,
    /// multi-column terms only
    pub term_tests: Vec<ChiSquareTest>,
    pub global_tests: Vec<ChiSquareTest>,
    pub n_obs: usize,
    pub n_events: usize,
    pub iterations: usize,
    pub ties: TieMethod,
    pub confidence: f64,
    pub strata: Vec<String>,
}

impl FitSummary {
    /// print out what we learned
    pub fn print(&self) {
        println!("{}", self);
    }
}

impl fmt::Display for FitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cox proportional hazards model")?;
        writeln!(f, "==============================")?;
        writeln!(
            f,
            "n = {}, events = {}, ties = {:?}, iterations = {}",
            self.n_obs, self.n_events, self.ties, self.iterations
        )?;
        if !self.strata.is_empty() {
            writeln!(f, "strata: {}", self.strata.join("; "))?;
        }
        writeln!(f)?;

        let pct = (self.confidence * 100.0).round();
        writeln!(
            f,
            "{:<24} {:>10} {:>10} {:>10} {:>8} {:>10} {:>10} {:>10}",
            "term",
            "coef",
            "exp(coef)",
            "se(coef)",
            "z",
            "p",
            format!("lower {}", pct),
            format!("upper {}", pct)
        )?;
        writeln!(f, "{:-<99}", "")?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<24} {:>10.4} {:>10.4} {:>10.4} {:>8.3} {:>10.4} {:>10.4} {:>10.4} {}",
                row.name,
                row.coefficient,
                row.hazard_ratio,
                row.std_error,
                row.z,
                row.p_value,
                row.lower,
                row.upper,
                significance_stars(row.p_value)
            )?;
        }

        if !self.term_tests.is_empty() {
            writeln!(f)?;
            writeln!(f, "{:<24} {:>10} {:>5} {:>10}", "term wald tests", "chi2", "df", "p")?;
            for test in &self.term_tests {
                writeln!(f, "{}", test)?;
            }
        }

        writeln!(f)?;
        writeln!(f, "{:<24} {:>10} {:>5} {:>10}", "global tests", "chi2", "df", "p")?;
        for test in &self.global_tests {
            writeln!(f, "{}", test)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn create_test_design() -> DesignMatrix {
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let events = vec![true, false, true, true, false, true, true, false, true, true];
        let covariates = Array2::from_shape_vec(
            (10, 3),
            vec![
                1.0, 0.0, 0.5, //
                0.0, 1.0, -0.5, //
                1.0, 1.0, 0.0, //
                -1.0, 0.0, 1.0, //
                0.0, -1.0, -1.0, //
                1.0, -1.0, 0.5, //
                -1.0, 1.0, -0.5, //
                0.0, 0.0, 0.0, //
                0.5, 0.5, 1.5, //
                -0.5, 1.0, 0.2,
            ],
        )
        .unwrap();

        let names = vec!["age".to_string(), "sex".to_string(), "dose".to_string()];
        DesignMatrix::from_matrix(covariates, Some(names), times, events, None).unwrap()
    }

    #[test]
    fn test_model_creation() {
        let model = CoxModel::new()
            .with_ties(TieMethod::Breslow)
            .with_max_iterations(50)
            .with_tolerance(1e-10);

        assert_eq!(model.config().ties, TieMethod::Breslow);
        assert_eq!(model.config().max_iterations, 50);
        assert_eq!(model.config().tolerance, 1e-10);
    }

    #[test]
    fn test_fit_reports_counts_and_shapes() {
        let design = create_test_design();
        let fit = CoxModel::new().fit_design(&design).unwrap();

        assert_eq!(fit.n_obs(), 10);
        assert_eq!(fit.n_events(), 7);
        assert_eq!(fit.n_coefficients(), 3);
        assert_eq!(fit.covariance().dim(), (3, 3));
        assert_eq!(fit.column_names(), &["age", "sex", "dose"]);
        assert!(fit.loglik() >= fit.loglik_null());
        assert!(fit.std_errors().iter().all(|s| *s > 0.0));
    }

    #[test]
    fn test_hazard_ratio_round_trip() {
        let design = create_test_design();
        let fit = CoxModel::new().fit_design(&design).unwrap();
        for (b, hr) in fit.coefficients().iter().zip(fit.hazard_ratios().iter()) {
            assert_relative_eq!(hr.ln(), *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_single_column_wald_matches_z_squared() {
        let design = create_test_design();
        let fit = CoxModel::new().fit_design(&design).unwrap();
        let test = fit.term_wald_test("sex").unwrap();
        let z = fit.z_scores()[1];
        assert_relative_eq!(test.statistic, z * z, epsilon = 1e-8);
        assert_relative_eq!(test.p_value, fit.p_values()[1], epsilon = 1e-8);
    }

    #[test]
    fn test_global_tests_are_positive() {
        let design = create_test_design();
        let fit = CoxModel::new().fit_design(&design).unwrap();
        assert!(fit.likelihood_ratio_test().statistic >= 0.0);
        assert!(fit.wald_test().statistic >= 0.0);
        assert!(fit.score_test().statistic >= 0.0);
        assert_eq!(fit.score_test().df, 3.0);
    }

    #[test]
    fn test_term_lr_test_with_single_term_matches_global() {
        let design = create_test_design().select_columns(&[0]).unwrap();
        let model = CoxModel::new();
        let fit = model.fit_design(&design).unwrap();
        let term = model.term_likelihood_ratio_test(&fit, &design, "age").unwrap();
        assert_relative_eq!(term.statistic, fit.likelihood_ratio_test().statistic, epsilon = 1e-10);
    }

    #[test]
    fn test_unknown_term_is_a_formula_error() {
        let design = create_test_design();
        let fit = CoxModel::new().fit_design(&design).unwrap();
        assert!(matches!(fit.term_wald_test("bmi"), Err(SurvivalError::Formula { .. })));
    }

    #[test]
    fn test_summary_lists_every_column() {
        let design = create_test_design();
        let fit = CoxModel::new().fit_design(&design).unwrap();
        let summary = fit.summary();
        assert_eq!(summary.rows.len(), 3);
        let text = summary.to_string();
        for name in ["age", "sex", "dose", "likelihood ratio", "score"] {
            assert!(text.contains(name), "missing {} in\n{}", name, text);
        }
    }

    #[test]
    fn test_outcome_dimension_mismatch() {
        let design = create_test_design();
        let times = Array1::from(vec![1.0, 2.0]);
        let result = CoxModel::new().fit(&design, times.view(), &[true, true], None);
        assert!(matches!(result, Err(SurvivalError::InvalidDimensions { .. })));
    }
}
