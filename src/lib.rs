//! # cox survival
//!
//! cox proportional hazards w/ multiple imputation - survival regression that
//! doesn't throw away incomplete rows
//!
//! ## what you get
//!
//! - validated datasets w/ explicit missing values (no sentinel 0s)
//! - formulas as term trees: linear, restricted cubic splines, interactions, strata
//! - newton-raphson cox fits w/ efron or breslow ties
//! - chained-equation imputation (predictive mean matching) + rubin's rules
//! - schoenfeld-residual checks of the proportional hazards assumption
//! - m fits in parallel when you impute
//!
//! ## quick start
//!
//! ```rust
//! use cox_survival::{build, validate, CovariateSpec, CoxModel, RawRecord, SurvivalRegression};
//! use cox_survival::parse_formula;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let specs = vec![
//!     CovariateSpec::continuous("age"),
//!     CovariateSpec::categorical("treat", vec!["placebo", "drug"]),
//! ];
//! let records: Vec<RawRecord> = (0..40)
//!     .map(|i| {
//!         let treat = if i % 2 == 0 { "placebo" } else { "drug" };
//!         let time = 1.0 + ((i * 7) % 23) as f64 + if i % 2 == 0 { 0.0 } else { 6.0 };
//!         RawRecord::new(time, (i % 4 != 0) as i64)
//!             .with_numeric("age", 50.0 + ((i * 13) % 17) as f64)
//!             .with_category("treat", treat)
//!     })
//!     .collect();
//! let data = validate(&records, &specs)?;
//!
//! let design = build(&data, &parse_formula("age + treat")?)?;
//! let fit = CoxModel::new().fit_design(&design)?;
//!
//! let hazard_ratios = fit.hazard_ratios();
//! assert_eq!(hazard_ratios.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod convert;
pub mod data;
pub mod design;
pub mod diagnostics;
pub mod error;
pub mod formula;
pub mod impute;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod notation;
pub mod optimization;
pub mod pipeline;
pub mod pool;
pub mod predict;
pub mod spline;

pub use config::EngineConfig;
pub use data::{validate, validate_coded, CovariateSpec, Dataset, RawRecord, StatusCoding, Value};
pub use design::{build, DesignMatrix};
pub use diagnostics::check_proportional_hazards;
pub use error::{Result, SurvivalError};
pub use formula::{Formula, Term};
pub use impute::{impute, ImputationConfig};
pub use model::{CoxModel, FitResult, SurvivalRegression};
pub use notation::parse_formula;
pub use optimization::TieMethod;
pub use pipeline::fit_imputed;
pub use pool::{pool, PooledEstimate};
pub use predict::DataDistribution;
