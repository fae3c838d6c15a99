//! Impute, fit on every completed dataset in parallel, pool.

use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::data::Dataset;
use crate::design::{DesignBuilder, DesignConfig};
use crate::diagnostics::{check_proportional_hazards_with, PhTest};
use crate::error::{Result, SurvivalError};
use crate::formula::Formula;
use crate::impute::{impute, ImputationConfig, ImputedDatasetSet};
use crate::model::{CoxModel, FitResult, SurvivalRegression};
use crate::pool::{collect_fits, pool, PooledEstimate};

/// everything produced along the way, for inspection
#[derive(Debug, Clone)]
pub struct ImputedFit {
    pub imputations: ImputedDatasetSet,
    pub fits: Vec<FitResult>,
    pub pooled: PooledEstimate,
}

/// Multiply impute `dataset`, fit `formula` on each completed copy and pool.
pub fn fit_imputed(
    dataset: &Dataset,
    formula: &Formula,
    imputation: &ImputationConfig,
    model: &CoxModel,
    design: &DesignConfig,
) -> Result<ImputedFit> {
    let imputations = impute(dataset, imputation)?;
    let builder = DesignBuilder::new(*design);
    let datasets = imputations.datasets();

    // knots, levels and centres are frozen on the first completed dataset so
    // every fit estimates the same columns
    let first = match datasets.first() {
        Some(completed) => builder.build(completed, formula),
        None => return Err(SurvivalError::degenerate_fit("imputation produced no datasets")),
    };
    let layout = first.as_ref().ok().map(|matrix| matrix.layout().clone());

    // read-only fan-out; every fit has to succeed before pooling
    let mut results: Vec<Result<FitResult>> = vec![first.and_then(|matrix| model.fit_design(&matrix))];
    results.par_extend(datasets[1..].par_iter().map(|completed| {
        let matrix = match &layout {
            Some(layout) => builder.build_with_layout(completed, layout)?,
            None => builder.build(completed, formula)?,
        };
        model.fit_design(&matrix)
    }));
    let fits = collect_fits(results)?;
    let pooled = pool(&fits)?;

    Ok(ImputedFit {
        imputations,
        fits,
        pooled,
    })
}

/// [`fit_imputed`] with every setting taken from one engine config
pub fn fit_imputed_with(dataset: &Dataset, formula: &Formula, config: &EngineConfig) -> Result<ImputedFit> {
    config.validate()?;
    let model = CoxModel::from_config(config.solver.clone());
    fit_imputed(dataset, formula, &config.imputation, &model, &config.design)
}

/// Proportional hazards test on every completed dataset, rebuilt with the
/// layout each fit was frozen on and the config's time transform.
pub fn check_imputed_proportional_hazards(result: &ImputedFit, config: &EngineConfig) -> Result<Vec<PhTest>> {
    config.validate()?;
    let builder = DesignBuilder::new(config.design);
    result
        .imputations
        .datasets()
        .par_iter()
        .zip(result.fits.par_iter())
        .map(|(completed, fit)| {
            let design = builder.build_with_layout(completed, fit.layout())?;
            check_proportional_hazards_with(fit, &design, design.times(), design.events(), &config.diagnostics)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{validate, CovariateSpec, RawRecord};
    use crate::design::Encoding;
    use crate::diagnostics::TimeTransform;
    use approx::assert_relative_eq;

    fn dataset(with_missing: bool) -> Dataset {
        let specs = vec![
            CovariateSpec::continuous("age"),
            CovariateSpec::categorical("treat", vec!["placebo", "drug"]),
        ];
        let records: Vec<RawRecord> = (0..60)
            .map(|i| {
                let age = 45.0 + ((i * 7) % 25) as f64;
                let treat = if i % 2 == 0 { "placebo" } else { "drug" };
                let time = 2.0 + ((i * 11) % 53) as f64 + if i % 2 == 0 { 0.0 } else { 10.0 };
                let record = RawRecord::new(time, (i % 5 != 0) as i64).with_category("treat", treat);
                if with_missing && i % 6 == 3 {
                    record.with_missing("age")
                } else {
                    record.with_numeric("age", age)
                }
            })
            .collect();
        validate(&records, &specs).unwrap()
    }

    #[test]
    fn test_complete_data_pools_to_the_single_fit() {
        let data = dataset(false);
        let formula = Formula::new().linear("age").linear("treat");
        let config = ImputationConfig::new().with_m(3);
        let result = fit_imputed(&data, &formula, &config, &CoxModel::new(), &DesignConfig::default()).unwrap();

        assert_eq!(result.fits.len(), 3);
        let single = &result.fits[0];
        for j in 0..2 {
            assert_relative_eq!(result.pooled.coefficients()[j], single.coefficients()[j], epsilon = 1e-12);
            assert_relative_eq!(
                result.pooled.total()[[j, j]],
                single.covariance()[[j, j]],
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_missing_ages_are_imputed_then_pooled() {
        let data = dataset(true);
        let formula = Formula::new().linear("age").linear("treat");
        let config = EngineConfig::from_toml_str("[imputation]\nm = 4\nmax_iterations = 3").unwrap();
        let result = fit_imputed_with(&data, &formula, &config).unwrap();

        assert_eq!(result.imputations.len(), 4);
        assert_eq!(result.pooled.m(), 4);
        assert_eq!(result.pooled.column_names(), &["age", "treat=drug"]);
        assert!(result.fits.iter().all(|f| f.n_obs() == 60));
    }

    #[test]
    fn test_spline_knots_are_shared_across_imputations() {
        let data = dataset(true);
        let formula = Formula::new().spline("age", 4).linear("treat");
        let config = ImputationConfig::new().with_m(5).with_max_iterations(3);
        let result = fit_imputed(&data, &formula, &config, &CoxModel::new(), &DesignConfig::default()).unwrap();

        let knots: Vec<Vec<f64>> = result
            .fits
            .iter()
            .map(|fit| match &fit.layout().blocks()[0].encoding {
                Encoding::Spline { spline, .. } => spline.knots().to_vec(),
                other => panic!("expected a spline block, got {:?}", other),
            })
            .collect();
        assert_eq!(knots.len(), 5);
        assert!(knots.iter().all(|k| k == &knots[0]));
        assert!(result.fits.iter().all(|f| f.layout() == result.fits[0].layout()));
        assert_eq!(result.pooled.column_names(), result.fits[0].column_names());
    }

    #[test]
    fn test_imputed_ph_check_uses_configured_transform() {
        let data = dataset(true);
        let formula = Formula::new().linear("age").linear("treat");
        let config = EngineConfig::from_toml_str(
            "[imputation]\nm = 3\nmax_iterations = 3\n\n[diagnostics]\ntransform = \"KaplanMeier\"",
        )
        .unwrap();
        let result = fit_imputed_with(&data, &formula, &config).unwrap();

        let tests = check_imputed_proportional_hazards(&result, &config).unwrap();
        assert_eq!(tests.len(), 3);
        for test in &tests {
            assert_eq!(test.transform, TimeTransform::KaplanMeier);
            assert_eq!(test.per_column.len(), 2);
            assert!((0.0..=1.0).contains(&test.global.p_value));
        }

        let identity = EngineConfig::from_toml_str("[diagnostics]\ntransform = \"Identity\"").unwrap();
        let tests = check_imputed_proportional_hazards(&result, &identity).unwrap();
        assert!(tests.iter().all(|t| t.transform == TimeTransform::Identity));
    }

    #[test]
    fn test_failed_fit_makes_pool_degenerate() {
        let data = dataset(true);
        // splines need a continuous covariate, so every per-imputation build fails
        let formula = Formula::new().spline("treat", 3);
        let err = fit_imputed(
            &data,
            &formula,
            &ImputationConfig::new().with_m(2),
            &CoxModel::new(),
            &DesignConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SurvivalError::DegenerateFit { .. }));
    }
}
