//! One TOML document configuring every stage of the engine.

use serde::{Deserialize, Serialize};

use crate::design::DesignConfig;
use crate::diagnostics::DiagnosticsConfig;
use crate::error::{Result, SurvivalError};
use crate::impute::ImputationConfig;
use crate::optimization::OptimizationConfig;

/// Settings for design building, the solver, imputation and PH diagnostics.
///
/// Every section and field is optional in TOML; missing ones take their defaults.
///
/// ```toml
/// [solver]
/// ties = "Breslow"
/// max_iterations = 50
///
/// [imputation]
/// m = 20
/// seed = 7
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub design: DesignConfig,
    pub solver: OptimizationConfig,
    pub imputation: ImputationConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// reject values no component could run with
    pub fn validate(&self) -> Result<()> {
        let solver = &self.solver;
        if solver.max_iterations == 0 {
            return Err(SurvivalError::config("solver.max_iterations must be at least 1"));
        }
        if !(solver.tolerance > 0.0) {
            return Err(SurvivalError::config(format!(
                "solver.tolerance must be positive, got {}",
                solver.tolerance
            )));
        }
        if !(solver.singularity_tolerance >= 0.0) {
            return Err(SurvivalError::config("solver.singularity_tolerance must be non-negative"));
        }

        let imputation = &self.imputation;
        if imputation.m == 0 {
            return Err(SurvivalError::config("imputation.m must be at least 1"));
        }
        if imputation.donors == 0 {
            return Err(SurvivalError::config("imputation.donors must be at least 1"));
        }
        if imputation.max_iterations == 0 {
            return Err(SurvivalError::config("imputation.max_iterations must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::{Centering, MissingPolicy};
    use crate::diagnostics::TimeTransform;
    use crate::optimization::TieMethod;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.solver.max_iterations, 25);
        assert_eq!(config.solver.tolerance, 1e-8);
        assert_eq!(config.solver.singularity_tolerance, 1e-10);
        assert_eq!(config.imputation.donors, 5);
        assert_eq!(config.imputation.max_iterations, 10);
        assert_eq!(config.imputation.max_predictors, 25);
        assert_eq!(config.diagnostics.transform, TimeTransform::Rank);
    }

    #[test]
    fn test_partial_sections() {
        let text = r#"
            [design]
            centering = "Mean"
            missing = "CompleteCase"

            [solver]
            ties = "Breslow"

            [imputation]
            m = 20
            seed = 7

            [imputation.predictor_overrides]
            bmi = ["age", "sex"]

            [diagnostics]
            transform = "KaplanMeier"
        "#;
        let config = EngineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.design.centering, Centering::Mean);
        assert_eq!(config.design.missing, MissingPolicy::CompleteCase);
        assert_eq!(config.solver.ties, TieMethod::Breslow);
        assert_eq!(config.solver.max_iterations, 25);
        assert_eq!(config.imputation.m, 20);
        assert_eq!(config.imputation.seed, 7);
        assert_eq!(config.imputation.predictor_overrides["bmi"], vec!["age", "sex"]);
        assert_eq!(config.diagnostics.transform, TimeTransform::KaplanMeier);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = EngineConfig::default();
        config.imputation.m = 3;
        config.solver.ties = TieMethod::Breslow;
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        for text in ["[solver]\nmax_iterations = 0", "[imputation]\nm = 0", "[solver]\nties = \"Exact\""] {
            assert!(
                matches!(EngineConfig::from_toml_str(text), Err(SurvivalError::Config { .. })),
                "{:?} should be rejected",
                text
            );
        }
    }
}
