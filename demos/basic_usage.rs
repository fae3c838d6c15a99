use std::collections::HashMap;

use cox_survival::diagnostics::check_proportional_hazards;
use cox_survival::metrics::ModelMetrics;
use cox_survival::predict::{interquartile_hazard_ratio, partial_effect, survival_curve};
use cox_survival::{
    build, parse_formula, validate, CovariateSpec, CoxModel, DataDistribution, Dataset, RawRecord,
    SurvivalRegression, TieMethod, Value,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// age, treatment, biomarker and clinic for `n` simulated patients
fn simulate_patients(n: usize) -> Result<Dataset, Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(7);
    let specs = vec![
        CovariateSpec::continuous("age"),
        CovariateSpec::categorical("treatment", vec!["control", "active"]),
        CovariateSpec::continuous("biomarker"),
        CovariateSpec::stratum("clinic", vec!["north", "south"]),
    ];

    let records: Vec<RawRecord> = (0..n)
        .map(|_| {
            let age: f64 = rng.gen_range(45.0..80.0);
            let active = rng.gen_bool(0.5);
            let biomarker: f64 = rng.gen_range(0.5..4.0);
            let south = rng.gen_bool(0.4);

            // u-shaped age effect, protective treatment
            let lp = 0.002 * (age - 62.0).powi(2) - 0.6 * (active as i32 as f64) + 0.3 * biomarker;
            let baseline = if south { 0.08 } else { 0.05 };
            let u: f64 = rng.r#gen();
            let time = (-(1.0 - u).ln() / (baseline * f64::exp(lp))).max(0.05);
            let follow_up = rng.gen_range(3.0..15.0);

            RawRecord::new(time.min(follow_up), (time < follow_up) as i64)
                .with_numeric("age", age)
                .with_category("treatment", if active { "active" } else { "control" })
                .with_numeric("biomarker", biomarker)
                .with_category("clinic", if south { "south" } else { "north" })
        })
        .collect();

    Ok(validate(&records, &specs)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Cox Proportional Hazards Model - Basic Usage Example");
    println!("====================================================\n");

    let data = simulate_patients(300)?;
    println!("Dataset Information:");
    println!("  - Number of patients: {}", data.n_samples());
    println!("  - Number of events: {}", data.n_events());
    println!("  - Number of censored: {}", data.n_samples() - data.n_events());
    println!();

    // Example 1: linear terms
    println!("Example 1: Linear Cox Regression");
    println!("--------------------------------");

    let linear = parse_formula("age + treatment + biomarker")?;
    let linear_design = build(&data, &linear)?;
    let linear_fit = CoxModel::new().fit_design(&linear_design)?;
    linear_fit.summary().print();
    ModelMetrics::compute(&linear_fit, &linear_design)?.print();
    println!("\n");

    // Example 2: spline + interaction, stratified by clinic
    println!("Example 2: Splines, Interactions and Strata");
    println!("-------------------------------------------");

    let flexible = parse_formula("rcs(age, 4) + treatment*biomarker + strat(clinic)")?;
    let flexible_design = build(&data, &flexible)?;
    let breslow = CoxModel::new().with_ties(TieMethod::Breslow);
    let flexible_fit = breslow.fit_design(&flexible_design)?;
    flexible_fit.summary().print();

    let nonlinear = breslow.term_likelihood_ratio_test(&flexible_fit, &flexible_design, "rcs(age, 4)")?;
    println!("dropping the age spline: {}", nonlinear);
    println!("\n");

    // Example 3: proportional hazards check
    println!("Example 3: Proportional Hazards Diagnostics");
    println!("-------------------------------------------");

    let ph = check_proportional_hazards(
        &flexible_fit,
        &flexible_design,
        flexible_design.times(),
        flexible_design.events(),
    )?;
    ph.print();
    println!("\n");

    // Example 4: predictions against an explicit data distribution
    println!("Example 4: Predictions for New Patients");
    println!("---------------------------------------");

    let dist = DataDistribution::from_dataset(&data)?;
    let iqr = interquartile_hazard_ratio(&flexible_fit, &dist, "biomarker", 0.95)?;
    println!(
        "biomarker inter-quartile hazard ratio: {:.3} ({:.3}, {:.3})",
        iqr.hazard_ratio, iqr.lower, iqr.upper
    );

    let ages: Vec<Value> = [50.0, 60.0, 70.0, 80.0].iter().map(|&a| Value::Numeric(a)).collect();
    let curve = partial_effect(&flexible_fit, &dist, "age", &ages, 0.95)?;
    for (i, value) in curve.values.iter().enumerate() {
        println!(
            "  {:?}: log relative hazard {:>7.3} [{:>7.3}, {:>7.3}]",
            value, curve.log_relative_hazard[i], curve.lower[i], curve.upper[i]
        );
    }
    println!();

    let time_points = [1.0, 2.0, 5.0, 10.0];
    println!("Survival probabilities:");
    println!("Time:                    1.0    2.0    5.0   10.0");
    for (label, age, treatment, clinic) in [
        ("A (55, active, north)", 55.0, "active", "north"),
        ("B (75, control, south)", 75.0, "control", "south"),
    ] {
        let patient = HashMap::from([
            ("age".to_string(), Value::Numeric(age)),
            ("treatment".to_string(), Value::category(treatment)),
            ("biomarker".to_string(), Value::Numeric(2.0)),
            ("clinic".to_string(), Value::category(clinic)),
        ]);
        let survival = survival_curve(&flexible_fit, &dist, &patient, &time_points)?;
        print!("Patient {}:", label);
        for s in survival {
            print!(" {:.3}", s);
        }
        println!();
    }

    Ok(())
}
