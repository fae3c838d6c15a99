use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::convert::SpdFactor;
use crate::error::{Result, SurvivalError};

/// how tied event times enter the partial likelihood
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TieMethod {
    #[default]
    Efron,
    Breslow,
}

/// Configuration for Newton-Raphson on the Cox partial likelihood
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub max_iterations: usize,
    /// converged once sᵀ I⁻¹ s drops below this
    pub tolerance: f64,
    pub ties: TieMethod,
    /// Cholesky pivots below this fraction of the column scale count as singular
    pub singularity_tolerance: f64,
    pub max_step_halvings: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
            ties: TieMethod::Efron,
            singularity_tolerance: 1e-10,
            max_step_halvings: 10,
        }
    }
}

/// coefficient size past which the likelihood is probably monotone
const LARGE_COEFFICIENT: f64 = 15.0;

/// per unit squared mean, added to the singularity scale
const SCALE_FLOOR: f64 = 1e-8;

/// Shared flag checked between Newton-Raphson iterations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// log partial likelihood and its first two derivatives at one beta
#[derive(Debug, Clone)]
pub struct CoxDerivatives {
    pub loglik: f64,
    pub score: Array1<f64>,
    /// observed information (negative Hessian)
    pub information: Array2<f64>,
}

/// one event's contribution, used for residuals
#[derive(Debug, Clone)]
pub struct EventContribution {
    pub row: usize,
    pub time: f64,
    pub stratum: usize,
    /// risk-set weighted covariate mean (Efron-averaged over tied events)
    pub expected: Array1<f64>,
}

/// baseline hazard jump at one distinct event time within a stratum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HazardIncrement {
    pub stratum: usize,
    pub time: f64,
    pub increment: f64,
}

/// Risk-set bookkeeping for one (possibly stratified) data set.
///
/// Covariates are centred internally; coefficients are unaffected because the
/// partial likelihood is invariant to shifting every linear predictor.
pub struct PartialLikelihood {
    x: Array2<f64>,
    means: Array1<f64>,
    times: Array1<f64>,
    events: Vec<bool>,
    /// per stratum: row indices sorted by time, latest first
    strata: Vec<Vec<usize>>,
    n_events: usize,
}

#[derive(Debug, Clone)]
struct Accumulated {
    loglik: f64,
    score: Array1<f64>,
    information: Array2<f64>,
}

impl PartialLikelihood {
    pub fn new(
        x: ArrayView2<f64>,
        times: ArrayView1<f64>,
        events: &[bool],
        strata: Option<&[usize]>,
    ) -> Result<Self> {
        let n = x.nrows();
        if times.len() != n || events.len() != n {
            return Err(SurvivalError::invalid_dimensions(format!(
                "covariate rows ({}), times ({}) and events ({}) must match",
                n,
                times.len(),
                events.len()
            )));
        }
        if times.iter().any(|&t| t <= 0.0 || !t.is_finite()) {
            return Err(SurvivalError::schema("survival times must be positive & finite"));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(SurvivalError::numerical_error("design matrix has non-finite entries"));
        }
        let n_events = events.iter().filter(|&&e| e).count();
        if n_events == 0 {
            return Err(SurvivalError::schema("no events - the partial likelihood is flat"));
        }

        let groups = match strata {
            Some(ids) => {
                if ids.len() != n {
                    return Err(SurvivalError::invalid_dimensions(format!(
                        "strata len ({}) != n_samples ({})",
                        ids.len(),
                        n
                    )));
                }
                let n_strata = ids.iter().max().map_or(0, |m| m + 1);
                let mut groups: Vec<Vec<usize>> = vec![Vec::new(); n_strata];
                for (i, &s) in ids.iter().enumerate() {
                    groups[s].push(i);
                }
                // empty ids stay so stratum indices keep matching the caller's ids
                groups
            }
            None => vec![(0..n).collect()],
        };
        let strata = groups
            .into_iter()
            .map(|mut rows| {
                rows.sort_by(|&a, &b| times[b].total_cmp(&times[a]));
                rows
            })
            .collect();

        let means = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let centered = &x - &means;

        Ok(Self {
            x: centered,
            means,
            times: times.to_owned(),
            events: events.to_vec(),
            strata,
            n_events,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_events(&self) -> usize {
        self.n_events
    }

    pub fn n_strata(&self) -> usize {
        self.strata.len()
    }

    /// column means the covariates were centred on
    pub fn means(&self) -> &Array1<f64> {
        &self.means
    }

    /// linear predictors on the centred scale
    pub fn linear_predictors(&self, beta: &Array1<f64>) -> Array1<f64> {
        self.x.dot(beta)
    }

    /// Per-column reference for the singularity check: events times the
    /// centred variance, plus a floor that grows with the column mean since
    /// that is where centring round-off comes from. A constant column has only
    /// round-off left and fails; a large offset does not.
    pub fn column_scale(&self) -> Vec<f64> {
        let n = self.n_samples().max(1) as f64;
        (0..self.n_features())
            .map(|j| {
                let m = self.means[j];
                let variance = self.x.column(j).iter().map(|&c| c * c).sum::<f64>() / n;
                self.n_events as f64 * (variance + SCALE_FLOOR * (1.0 + m * m))
            })
            .collect()
    }

    /// Compute log partial likelihood and its derivatives
    pub fn compute_likelihood_derivatives(
        &self,
        beta: &Array1<f64>,
        ties: TieMethod,
    ) -> Result<CoxDerivatives> {
        if beta.len() != self.n_features() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "beta has {} entries for {} columns",
                beta.len(),
                self.n_features()
            )));
        }
        let eta = self.shifted_eta(beta);

        // strata are independent: fan out, then add up in stratum order
        let parts: Vec<Accumulated> = self
            .strata
            .par_iter()
            .map(|rows| self.accumulate_stratum(rows, &eta, ties))
            .collect();

        let p = self.n_features();
        let mut total = Accumulated {
            loglik: 0.0,
            score: Array1::zeros(p),
            information: Array2::zeros((p, p)),
        };
        for part in parts {
            total.loglik += part.loglik;
            total.score += &part.score;
            total.information += &part.information;
        }

        if !total.loglik.is_finite() && total.loglik != f64::NEG_INFINITY {
            return Err(SurvivalError::numerical_error(format!(
                "log-likelihood evaluated to {}",
                total.loglik
            )));
        }

        Ok(CoxDerivatives {
            loglik: total.loglik,
            score: total.score,
            information: total.information,
        })
    }

    /// eta shifted by its maximum so exp() never overflows
    fn shifted_eta(&self, beta: &Array1<f64>) -> Array1<f64> {
        let eta = self.x.dot(beta);
        let max = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max.is_finite() {
            eta - max
        } else {
            eta
        }
    }

    fn accumulate_stratum(&self, rows: &[usize], eta: &Array1<f64>, ties: TieMethod) -> Accumulated {
        let p = self.n_features();
        let mut acc = Accumulated {
            loglik: 0.0,
            score: Array1::zeros(p),
            information: Array2::zeros((p, p)),
        };

        self.for_each_event_time(rows, eta, |stats| {
            for &r in stats.dead {
                acc.loglik += eta[r];
                acc.score += &self.x.row(r);
            }
            let d = stats.dead.len() as f64;
            for l in 0..stats.dead.len() {
                let frac = match ties {
                    TieMethod::Efron => l as f64 / d,
                    TieMethod::Breslow => 0.0,
                };
                let denom = stats.s0 - frac * stats.d0;
                let mean = (stats.s1 - &(frac * stats.d1)) / denom;
                acc.loglik -= denom.ln();
                acc.score -= &mean;
                let second = (stats.s2 - &(frac * stats.d2)) / denom;
                acc.information += &second;
                for j in 0..p {
                    for k in 0..p {
                        acc.information[[j, k]] -= mean[j] * mean[k];
                    }
                }
            }
        });

        acc
    }

    /// Walk distinct times from latest to earliest, keeping running risk-set
    /// sums, and hand every time with at least one event to `visit`.
    fn for_each_event_time<F>(&self, rows: &[usize], eta: &Array1<f64>, mut visit: F)
    where
        F: FnMut(RiskSetStatistics<'_>),
    {
        let p = self.n_features();
        let mut s0 = 0.0;
        let mut s1 = Array1::<f64>::zeros(p);
        let mut s2 = Array2::<f64>::zeros((p, p));
        let mut dead = Vec::new();

        let mut i = 0;
        while i < rows.len() {
            let t = self.times[rows[i]];
            let mut d0 = 0.0;
            let mut d1 = Array1::<f64>::zeros(p);
            let mut d2 = Array2::<f64>::zeros((p, p));
            dead.clear();

            while i < rows.len() && self.times[rows[i]] == t {
                let r = rows[i];
                let w = eta[r].exp();
                let xr = self.x.row(r);
                s0 += w;
                s1.scaled_add(w, &xr);
                add_outer(&mut s2, xr, w);
                if self.events[r] {
                    dead.push(r);
                    d0 += w;
                    d1.scaled_add(w, &xr);
                    add_outer(&mut d2, xr, w);
                }
                i += 1;
            }

            if !dead.is_empty() {
                visit(RiskSetStatistics {
                    time: t,
                    dead: &dead,
                    s0,
                    s1: &s1,
                    s2: &s2,
                    d0,
                    d1: &d1,
                    d2: &d2,
                });
            }
        }
    }

    /// risk-set means for every event, in increasing time order within each stratum
    pub fn event_contributions(&self, beta: &Array1<f64>, ties: TieMethod) -> Vec<EventContribution> {
        let eta = self.shifted_eta(beta);
        let mut out = Vec::with_capacity(self.n_events);
        for (stratum, rows) in self.strata.iter().enumerate() {
            let mut chunk = Vec::new();
            self.for_each_event_time(rows, &eta, |stats| {
                let d = stats.dead.len() as f64;
                let mut expected = Array1::<f64>::zeros(self.n_features());
                for l in 0..stats.dead.len() {
                    let frac = match ties {
                        TieMethod::Efron => l as f64 / d,
                        TieMethod::Breslow => 0.0,
                    };
                    let denom = stats.s0 - frac * stats.d0;
                    expected += &((stats.s1 - &(frac * stats.d1)) / denom);
                }
                expected /= d;
                for &r in stats.dead {
                    chunk.push(EventContribution {
                        row: r,
                        time: stats.time,
                        stratum,
                        expected: &expected + &self.means,
                    });
                }
            });
            // collected latest-first
            chunk.reverse();
            out.extend(chunk);
        }
        out
    }

    /// Baseline hazard jumps at the covariate means (Breslow or Efron estimator).
    pub fn hazard_increments(&self, beta: &Array1<f64>, ties: TieMethod) -> Vec<HazardIncrement> {
        // unshifted: the baseline refers to the mean covariate vector
        let eta = self.x.dot(beta);
        let mut out = Vec::new();
        for (stratum, rows) in self.strata.iter().enumerate() {
            let mut chunk = Vec::new();
            self.for_each_event_time(rows, &eta, |stats| {
                let d = stats.dead.len() as f64;
                let increment = (0..stats.dead.len())
                    .map(|l| {
                        let frac = match ties {
                            TieMethod::Efron => l as f64 / d,
                            TieMethod::Breslow => 0.0,
                        };
                        1.0 / (stats.s0 - frac * stats.d0)
                    })
                    .sum();
                chunk.push(HazardIncrement {
                    stratum,
                    time: stats.time,
                    increment,
                });
            });
            chunk.reverse();
            out.extend(chunk);
        }
        out
    }
}

struct RiskSetStatistics<'a> {
    time: f64,
    dead: &'a [usize],
    s0: f64,
    s1: &'a Array1<f64>,
    s2: &'a Array2<f64>,
    d0: f64,
    d1: &'a Array1<f64>,
    d2: &'a Array2<f64>,
}

fn add_outer(target: &mut Array2<f64>, x: ArrayView1<f64>, w: f64) {
    let p = x.len();
    for j in 0..p {
        let wx = w * x[j];
        for k in 0..p {
            target[[j, k]] += wx * x[k];
        }
    }
}

/// what a converged Newton-Raphson run hands back
#[derive(Debug, Clone)]
pub struct NewtonOutcome {
    pub coefficients: Array1<f64>,
    pub covariance: Array2<f64>,
    pub information: Array2<f64>,
    pub loglik: f64,
    pub loglik_null: f64,
    /// score test of beta = 0
    pub score_statistic: f64,
    pub iterations: usize,
    pub means: Array1<f64>,
}

/// Newton-Raphson maximizer of the Cox partial likelihood
#[derive(Debug, Clone, Default)]
pub struct CoxOptimizer {
    config: OptimizationConfig,
    cancel: Option<CancellationToken>,
}

impl CoxOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        Self { config, cancel: None }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    /// Maximize the partial likelihood of `problem`; `names` label singular columns.
    pub fn optimize(&self, problem: &PartialLikelihood, names: &[String]) -> Result<NewtonOutcome> {
        if self.config.max_iterations == 0 {
            return Err(SurvivalError::invalid_parameter("max_iterations", "0"));
        }
        let ties = self.config.ties;
        let scale = problem.column_scale();
        let mut beta = Array1::zeros(problem.n_features());
        let mut current = problem.compute_likelihood_derivatives(&beta, ties)?;
        let loglik_null = current.loglik;

        let mut factor = self.factorize(&current.information, &scale, names)?;
        let mut step = factor.solve(&current.score);
        let score_statistic = current.score.dot(&step);
        let mut decrement = score_statistic;

        for iteration in 0..self.config.max_iterations {
            if decrement < self.config.tolerance {
                return Ok(self.finish(beta, current, factor, loglik_null, score_statistic, iteration, problem));
            }
            if self.cancel.as_ref().map_or(false, CancellationToken::is_cancelled) {
                log::debug!("cox fit cancelled at iteration {}", iteration);
                return Err(SurvivalError::Cancelled);
            }

            // Newton-Raphson step, halved while the likelihood goes down
            let mut step_size = 1.0;
            let mut accepted = None;
            for _ in 0..=self.config.max_step_halvings {
                let candidate = &beta + &(step_size * &step);
                let derivs = problem.compute_likelihood_derivatives(&candidate, ties)?;
                if derivs.loglik.is_finite() && derivs.loglik >= current.loglik {
                    accepted = Some((candidate, derivs));
                    break;
                }
                step_size *= 0.5;
            }
            let (candidate, derivs) = accepted.ok_or_else(|| SurvivalError::NonConvergence {
                iterations: iteration + 1,
                score_norm: current.score.dot(&current.score).sqrt(),
                last_coefficients: beta.clone(),
            })?;

            log::debug!(
                "newton-raphson iteration {}: loglik {:.6} -> {:.6}, step {}",
                iteration + 1,
                current.loglik,
                derivs.loglik,
                step_size
            );

            beta = candidate;
            current = derivs;
            factor = self.factorize(&current.information, &scale, names)?;
            step = factor.solve(&current.score);
            decrement = current.score.dot(&step);
        }

        if decrement < self.config.tolerance {
            let iterations = self.config.max_iterations;
            return Ok(self.finish(beta, current, factor, loglik_null, score_statistic, iterations, problem));
        }

        Err(SurvivalError::NonConvergence {
            iterations: self.config.max_iterations,
            score_norm: current.score.dot(&current.score).sqrt(),
            last_coefficients: beta,
        })
    }

    fn factorize(&self, information: &Array2<f64>, scale: &[f64], names: &[String]) -> Result<SpdFactor> {
        SpdFactor::new(information, scale, self.config.singularity_tolerance).map_err(|j| {
            let column = names.get(j).cloned().unwrap_or_else(|| format!("x{}", j));
            SurvivalError::singular_information(column)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        beta: Array1<f64>,
        current: CoxDerivatives,
        factor: SpdFactor,
        loglik_null: f64,
        score_statistic: f64,
        iterations: usize,
        problem: &PartialLikelihood,
    ) -> NewtonOutcome {
        if beta.iter().any(|b| b.abs() > LARGE_COEFFICIENT) {
            log::warn!(
                "coefficient beyond ±{} - the likelihood may be monotone (separation)",
                LARGE_COEFFICIENT
            );
        }
        log::info!(
            "cox fit converged in {} iterations, loglik {:.4} (null {:.4})",
            iterations,
            current.loglik,
            loglik_null
        );
        NewtonOutcome {
            covariance: factor.inverse(),
            coefficients: beta,
            information: current.information,
            loglik: current.loglik,
            loglik_null,
            score_statistic,
            iterations,
            means: problem.means().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn create_test_problem() -> PartialLikelihood {
        let times = Array1::from(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let events = vec![true, true, false, true, true, true];
        let covariates = Array2::from_shape_vec(
            (6, 2),
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, -1.0, 0.0, 0.0, -1.0, 0.5, 0.5],
        )
        .unwrap();

        PartialLikelihood::new(covariates.view(), times.view(), &events, None).unwrap()
    }

    fn names() -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    #[test]
    fn test_score_matches_numeric_gradient() {
        let problem = create_test_problem();
        let beta = Array1::from(vec![0.3, -0.2]);
        let derivs = problem.compute_likelihood_derivatives(&beta, TieMethod::Efron).unwrap();

        let h = 1e-6;
        for j in 0..2 {
            let mut up = beta.clone();
            let mut down = beta.clone();
            up[j] += h;
            down[j] -= h;
            let l_up = problem.compute_likelihood_derivatives(&up, TieMethod::Efron).unwrap().loglik;
            let l_down = problem.compute_likelihood_derivatives(&down, TieMethod::Efron).unwrap().loglik;
            assert_relative_eq!(derivs.score[j], (l_up - l_down) / (2.0 * h), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_null_loglik_without_ties() {
        // at beta = 0: -sum log(risk set size) over events
        let problem = create_test_problem();
        let derivs = problem
            .compute_likelihood_derivatives(&Array1::zeros(2), TieMethod::Breslow)
            .unwrap();
        let expected = -(6.0f64.ln() + 5.0f64.ln() + 3.0f64.ln() + 2.0f64.ln() + 1.0f64.ln());
        assert_relative_eq!(derivs.loglik, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_efron_null_loglik_with_ties() {
        // two tied deaths out of three at risk, then one death alone
        let times = Array1::from(vec![1.0, 1.0, 1.0, 2.0]);
        let events = vec![true, true, false, true];
        let x = Array2::from_shape_vec((4, 1), vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        let problem = PartialLikelihood::new(x.view(), times.view(), &events, None).unwrap();
        let beta = Array1::zeros(1);

        let efron = problem.compute_likelihood_derivatives(&beta, TieMethod::Efron).unwrap();
        let breslow = problem.compute_likelihood_derivatives(&beta, TieMethod::Breslow).unwrap();
        // efron: -ln 4 - ln(4 - 1) ; breslow: -2 ln 4
        assert_relative_eq!(efron.loglik, -(4.0f64.ln() + 3.0f64.ln()), epsilon = 1e-12);
        assert_relative_eq!(breslow.loglik, -2.0 * 4.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_optimizer_converges_to_zero_score() {
        let problem = create_test_problem();
        let optimizer = CoxOptimizer::new(OptimizationConfig::default());
        let outcome = optimizer.optimize(&problem, &names()).unwrap();

        let derivs = problem
            .compute_likelihood_derivatives(&outcome.coefficients, TieMethod::Efron)
            .unwrap();
        assert!(derivs.score.iter().all(|s| s.abs() < 1e-3));
        assert!(outcome.loglik >= outcome.loglik_null);
        assert!(outcome.iterations <= 25);
    }

    #[test]
    fn test_iteration_cap_reports_last_iterate() {
        let problem = create_test_problem();
        let config = OptimizationConfig {
            max_iterations: 1,
            tolerance: 1e-30,
            ..Default::default()
        };
        match CoxOptimizer::new(config).optimize(&problem, &names()) {
            Err(SurvivalError::NonConvergence {
                iterations,
                last_coefficients,
                ..
            }) => {
                assert_eq!(iterations, 1);
                assert_eq!(last_coefficients.len(), 2);
            }
            other => panic!("expected NonConvergence, got {:?}", other.map(|o| o.coefficients)),
        }
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let problem = create_test_problem();
        let token = CancellationToken::new();
        token.cancel();
        let optimizer = CoxOptimizer::new(OptimizationConfig::default()).with_cancellation(token);
        assert!(matches!(
            optimizer.optimize(&problem, &names()),
            Err(SurvivalError::Cancelled)
        ));
    }

    #[test]
    fn test_constant_column_is_singular() {
        let times = Array1::from(vec![1.0, 2.0, 3.0, 4.0]);
        let events = vec![true, true, true, false];
        let x = Array2::from_shape_vec((4, 2), vec![0.1, 1.0, 0.1, 0.0, 0.1, 1.0, 0.1, 0.0]).unwrap();
        let problem = PartialLikelihood::new(x.view(), times.view(), &events, None).unwrap();
        match CoxOptimizer::default().optimize(&problem, &names()) {
            Err(SurvivalError::SingularInformation { column }) => assert_eq!(column, "a"),
            other => panic!("expected SingularInformation, got {:?}", other.map(|o| o.coefficients)),
        }
    }

    #[test]
    fn test_large_offset_column_is_not_singular() {
        let times = Array1::from(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let events = vec![true, false, true, true, false, true, true];
        let spread = [0.3, 0.0, 0.5, 0.1, 0.6, 0.2, 0.4];
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let design = |offset: f64| {
            let values: Vec<f64> = (0..7).flat_map(|i| [offset + spread[i], b[i]]).collect();
            Array2::from_shape_vec((7, 2), values).unwrap()
        };

        let shifted = design(1e5);
        let problem = PartialLikelihood::new(shifted.view(), times.view(), &events, None).unwrap();
        let scale = problem.column_scale();
        assert!(scale[0] < 1e4 * scale[1]);
        let outcome = CoxOptimizer::default().optimize(&problem, &names()).unwrap();

        let plain = design(0.0);
        let reference = PartialLikelihood::new(plain.view(), times.view(), &events, None).unwrap();
        let expected = CoxOptimizer::default().optimize(&reference, &names()).unwrap();
        for j in 0..2 {
            assert_relative_eq!(outcome.coefficients[j], expected.coefficients[j], epsilon = 1e-6);
        }
    }

    // Therneau's six-subject test1: one tied death pair at t = 6
    fn therneau_test1() -> PartialLikelihood {
        let times = Array1::from(vec![9.0, 1.0, 1.0, 6.0, 6.0, 8.0]);
        let events = vec![true, true, false, true, true, false];
        let x = Array2::from_shape_vec((6, 1), vec![0.0, 1.0, 1.0, 1.0, 0.0, 0.0]).unwrap();
        PartialLikelihood::new(x.view(), times.view(), &events, None).unwrap()
    }

    #[test]
    fn test_therneau_test1_estimates() {
        let problem = therneau_test1();
        let names = vec!["x".to_string()];
        for (ties, beta) in [(TieMethod::Efron, 1.676857), (TieMethod::Breslow, 1.475285)] {
            let config = OptimizationConfig {
                ties,
                ..Default::default()
            };
            let outcome = CoxOptimizer::new(config).optimize(&problem, &names).unwrap();
            assert_relative_eq!(outcome.coefficients[0], beta, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_strata_partition_risk_sets() {
        let times = Array1::from(vec![1.0, 2.0, 1.0, 2.0]);
        let events = vec![true, true, true, true];
        let x = Array2::from_shape_vec((4, 1), vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        let strata = [0, 0, 1, 1];
        let problem = PartialLikelihood::new(x.view(), times.view(), &events, Some(&strata)).unwrap();
        assert_eq!(problem.n_strata(), 2);

        let derivs = problem
            .compute_likelihood_derivatives(&Array1::zeros(1), TieMethod::Efron)
            .unwrap();
        // each stratum: -ln 2 - ln 1
        assert_relative_eq!(derivs.loglik, -2.0 * 2.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_event_contributions_follow_time_order() {
        let problem = create_test_problem();
        let contributions = problem.event_contributions(&Array1::zeros(2), TieMethod::Efron);
        assert_eq!(contributions.len(), 5);
        let times: Vec<f64> = contributions.iter().map(|c| c.time).collect();
        assert_eq!(times, vec![1.0, 2.0, 4.0, 5.0, 6.0]);
        // at beta = 0 the first event's expected value is the plain mean of everyone
        assert_relative_eq!(contributions[0].expected[0], 1.5 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_hazard_increments_at_zero_are_nelson_aalen() {
        let problem = create_test_problem();
        let increments = problem.hazard_increments(&Array1::zeros(2), TieMethod::Breslow);
        let jumps: Vec<f64> = increments.iter().map(|h| h.increment).collect();
        let expected = [1.0 / 6.0, 1.0 / 5.0, 1.0 / 3.0, 1.0 / 2.0, 1.0];
        for (a, b) in jumps.iter().zip(expected.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }
}
