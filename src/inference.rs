// =============================================================================
// Statistical Inference
// =============================================================================
//
// Reference distributions for the tests the engine reports:
//   - Wald z-tests on single coefficients (normal)
//   - pooled coefficients after multiple imputation (Student's t, Rubin df)
//   - chunk / global tests on several columns at once (chi-square, F)
//
// Every function returns NaN instead of failing on degenerate input so a
// summary table can still be assembled around one bad cell.
//
// =============================================================================

use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, Normal, StudentsT};

fn standard_normal() -> Option<Normal> {
    Normal::new(0.0, 1.0).ok()
}

/// Two-tailed p-value of a z-statistic against N(0, 1).
pub fn pvalue_z(z: f64) -> f64 {
    if !z.is_finite() {
        return f64::NAN;
    }
    match standard_normal() {
        // P(|Z| > |z|), upper tail taken directly so it doesn't round to zero
        Some(normal) => 2.0 * normal.sf(z.abs()),
        None => f64::NAN,
    }
}

/// Two-tailed p-value of a t-statistic with `df` degrees of freedom.
///
/// Infinite (or very large) df falls back to the normal reference.
pub fn pvalue_t(t: f64, df: f64) -> f64 {
    if !t.is_finite() || df.is_nan() || df <= 0.0 {
        return f64::NAN;
    }
    if df > 1e6 {
        return pvalue_z(t);
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * dist.sf(t.abs()),
        Err(_) => f64::NAN,
    }
}

/// Upper-tail p-value of a chi-square statistic.
pub fn pvalue_chi2(statistic: f64, df: f64) -> f64 {
    if !statistic.is_finite() || df <= 0.0 {
        return f64::NAN;
    }
    if statistic <= 0.0 {
        return 1.0;
    }
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(statistic).max(0.0),
        Err(_) => f64::NAN,
    }
}

/// Upper-tail p-value of an F statistic; infinite denominator df reduces to chi-square / df1.
pub fn pvalue_f(statistic: f64, df1: f64, df2: f64) -> f64 {
    if !statistic.is_finite() || df1 <= 0.0 || df2.is_nan() || df2 <= 0.0 {
        return f64::NAN;
    }
    if statistic <= 0.0 {
        return 1.0;
    }
    if df2 > 1e6 {
        return pvalue_chi2(statistic * df1, df1);
    }
    match FisherSnedecor::new(df1, df2) {
        Ok(dist) => dist.sf(statistic).max(0.0),
        Err(_) => f64::NAN,
    }
}

/// Two-sided normal critical value, e.g. 1.96 for `confidence = 0.95`.
pub fn z_critical(confidence: f64) -> f64 {
    if !(0.0..1.0).contains(&confidence) {
        return f64::NAN;
    }
    match standard_normal() {
        Some(normal) => normal.inverse_cdf(1.0 - (1.0 - confidence) / 2.0),
        None => f64::NAN,
    }
}

/// Two-sided Student's t critical value.
pub fn t_critical(confidence: f64, df: f64) -> f64 {
    if !(0.0..1.0).contains(&confidence) || df.is_nan() || df <= 0.0 {
        return f64::NAN;
    }
    if df > 1e6 {
        return z_critical(confidence);
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => dist.inverse_cdf(1.0 - (1.0 - confidence) / 2.0),
        Err(_) => f64::NAN,
    }
}

/// (lower, upper) normal-theory interval around `estimate`.
pub fn confidence_interval_z(estimate: f64, std_error: f64, confidence: f64) -> (f64, f64) {
    if !estimate.is_finite() || !std_error.is_finite() || std_error < 0.0 {
        return (f64::NAN, f64::NAN);
    }
    let margin = z_critical(confidence) * std_error;
    (estimate - margin, estimate + margin)
}

/// (lower, upper) t interval around `estimate`.
pub fn confidence_interval_t(estimate: f64, std_error: f64, df: f64, confidence: f64) -> (f64, f64) {
    if !estimate.is_finite() || !std_error.is_finite() || std_error < 0.0 {
        return (f64::NAN, f64::NAN);
    }
    let margin = t_critical(confidence, df) * std_error;
    (estimate - margin, estimate + margin)
}

/// Significance stars for summary tables.
pub fn significance_stars(pvalue: f64) -> &'static str {
    if pvalue < 0.001 {
        "***"
    } else if pvalue < 0.01 {
        "**"
    } else if pvalue < 0.05 {
        "*"
    } else if pvalue < 0.1 {
        "."
    } else {
        ""
    }
}
