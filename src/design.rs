//! Design builder: expands a [`Formula`] against a [`Dataset`] into a numeric
//! design matrix, stratum ids and the bookkeeping needed to report, test and
//! predict per term.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::data::{Column, CovariateKind, CovariateSpec, Dataset, Value};
use crate::error::{Result, SurvivalError};
use crate::formula::{Formula, Term};
use crate::spline::RestrictedCubicSpline;

/// continuous columns enter raw (the default) or mean-centred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Centering {
    #[default]
    Raw,
    Mean,
}

/// rows with a missing value in any formula variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MissingPolicy {
    /// fail with a schema error - impute first
    #[default]
    Reject,
    /// drop the incomplete rows
    CompleteCase,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignConfig {
    pub centering: Centering,
    pub missing: MissingPolicy,
}

/// how one (sub)term turns a row into numbers
#[derive(Debug, Clone, PartialEq)]
pub enum Encoding {
    Numeric { variable: String, center: f64 },
    Spline { variable: String, spline: RestrictedCubicSpline },
    /// one indicator per non-reference level
    Indicators { variable: String, levels: Vec<String> },
    Product(Box<Encoding>, Box<Encoding>),
    Strata { variable: String, levels: Vec<String> },
}

/// cell value as the encoder sees it
#[derive(Debug, Clone, Copy, PartialEq)]
enum Cell {
    Number(f64),
    Level(usize),
}

impl Encoding {
    pub fn width(&self) -> usize {
        match self {
            Encoding::Numeric { .. } => 1,
            Encoding::Spline { spline, .. } => spline.n_columns(),
            Encoding::Indicators { levels, .. } => levels.len().saturating_sub(1),
            Encoding::Product(a, b) => a.width() * b.width(),
            Encoding::Strata { .. } => 0,
        }
    }

    fn column_names(&self) -> Vec<String> {
        match self {
            Encoding::Numeric { variable, .. } => vec![variable.clone()],
            Encoding::Spline { variable, spline } => spline.column_names(variable),
            Encoding::Indicators { variable, levels } => levels
                .iter()
                .skip(1)
                .map(|l| format!("{}={}", variable, l))
                .collect(),
            Encoding::Product(a, b) => {
                let right = b.column_names();
                a.column_names()
                    .iter()
                    .flat_map(|l| right.iter().map(move |r| format!("{} * {}", l, r)))
                    .collect()
            }
            Encoding::Strata { .. } => Vec::new(),
        }
    }

    fn write_row<F>(&self, cell: &F, out: &mut Vec<f64>) -> Result<()>
    where
        F: Fn(&str) -> Result<Cell>,
    {
        match self {
            Encoding::Numeric { variable, center } => out.push(number(variable, cell(variable)?)? - center),
            Encoding::Spline { variable, spline } => {
                out.extend(spline.evaluate(number(variable, cell(variable)?)?))
            }
            Encoding::Indicators { variable, levels } => {
                let level = level(variable, cell(variable)?)?;
                out.extend((1..levels.len()).map(|l| if l == level { 1.0 } else { 0.0 }));
            }
            Encoding::Product(a, b) => {
                let mut left = Vec::with_capacity(a.width());
                let mut right = Vec::with_capacity(b.width());
                a.write_row(cell, &mut left)?;
                b.write_row(cell, &mut right)?;
                for l in &left {
                    out.extend(right.iter().map(|r| l * r));
                }
            }
            Encoding::Strata { .. } => {}
        }
        Ok(())
    }
}

fn number(variable: &str, cell: Cell) -> Result<f64> {
    match cell {
        Cell::Number(x) => Ok(x),
        Cell::Level(_) => Err(SurvivalError::formula(format!(
            "`{}` is categorical but was used as a number",
            variable
        ))),
    }
}

fn level(variable: &str, cell: Cell) -> Result<usize> {
    match cell {
        Cell::Level(l) => Ok(l),
        Cell::Number(_) => Err(SurvivalError::formula(format!(
            "`{}` is continuous but was used as a factor",
            variable
        ))),
    }
}

/// one expanded term and where its columns live
#[derive(Debug, Clone, PartialEq)]
pub struct TermBlock {
    pub term: Term,
    pub label: String,
    pub encoding: Encoding,
    pub columns: Range<usize>,
}

impl TermBlock {
    pub fn width(&self) -> usize {
        self.columns.len()
    }
}

/// Frozen encoding of a formula: knots, levels and centres are fixed at build
/// time so new rows can be encoded exactly like the training rows.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignLayout {
    blocks: Vec<TermBlock>,
    column_names: Vec<String>,
    variables: Vec<CovariateSpec>,
    strata: Vec<(String, Vec<String>)>,
}

impl DesignLayout {
    pub fn blocks(&self) -> &[TermBlock] {
        &self.blocks
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn n_columns(&self) -> usize {
        self.column_names.len()
    }

    /// variables the formula touches, with the levels in force at build time
    pub fn variables(&self) -> &[CovariateSpec] {
        &self.variables
    }

    /// stratification variables and their levels, in formula order
    pub fn strata_variables(&self) -> &[(String, Vec<String>)] {
        &self.strata
    }

    pub fn block(&self, label: &str) -> Option<&TermBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    /// encode a single subject given by variable name
    pub fn encode(&self, values: &HashMap<String, Value>) -> Result<Array1<f64>> {
        let cell = |name: &str| -> Result<Cell> {
            let spec = self
                .variables
                .iter()
                .find(|s| s.name == name)
                .ok_or_else(|| SurvivalError::schema(format!("unknown covariate `{}`", name)))?;
            match (values.get(name), spec.levels()) {
                (Some(Value::Numeric(x)), None) => Ok(Cell::Number(*x)),
                (Some(Value::Category(label)), Some(levels)) => levels
                    .iter()
                    .position(|l| l == label)
                    .map(Cell::Level)
                    .ok_or_else(|| {
                        SurvivalError::schema(format!("`{}` has no level `{}`", name, label))
                    }),
                (None, _) | (Some(Value::Missing), _) => Err(SurvivalError::schema(format!(
                    "no value for `{}`",
                    name
                ))),
                (Some(other), _) => Err(SurvivalError::schema(format!(
                    "`{}` = {:?} doesn't fit its kind",
                    name, other
                ))),
            }
        };

        let mut row = Vec::with_capacity(self.n_columns());
        for block in &self.blocks {
            block.encoding.write_row(&cell, &mut row)?;
        }
        Ok(Array1::from(row))
    }
}

/// numeric design with column -> term back-references
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    x: Array2<f64>,
    column_term: Vec<usize>,
    layout: DesignLayout,
    strata: Option<Vec<usize>>,
    strata_labels: Vec<String>,
    times: Array1<f64>,
    events: Vec<bool>,
    row_index: Vec<usize>,
}

impl DesignMatrix {
    /// Wrap an already-numeric covariate matrix, one linear term per column.
    pub fn from_matrix(
        x: Array2<f64>,
        column_names: Option<Vec<String>>,
        times: Vec<f64>,
        events: Vec<bool>,
        strata: Option<Vec<usize>>,
    ) -> Result<Self> {
        let n = times.len();
        if events.len() != n {
            return Err(SurvivalError::invalid_dimensions(format!(
                "times len ({}) != events len ({})",
                n,
                events.len()
            )));
        }
        if x.nrows() != n {
            return Err(SurvivalError::invalid_dimensions(format!(
                "covariate rows ({}) != n_samples ({})",
                x.nrows(),
                n
            )));
        }
        if let Some(s) = &strata {
            if s.len() != n {
                return Err(SurvivalError::invalid_dimensions(format!(
                    "strata len ({}) != n_samples ({})",
                    s.len(),
                    n
                )));
            }
        }
        if times.iter().any(|&t| t <= 0.0 || !t.is_finite()) {
            return Err(SurvivalError::schema("survival times must be positive & finite"));
        }
        let names = column_names.unwrap_or_else(|| (0..x.ncols()).map(|j| format!("x{}", j)).collect());
        if names.len() != x.ncols() {
            return Err(SurvivalError::invalid_dimensions(format!(
                "{} column names for {} columns",
                names.len(),
                x.ncols()
            )));
        }

        let blocks = names
            .iter()
            .enumerate()
            .map(|(j, name)| TermBlock {
                term: Term::linear(name.clone()),
                label: name.clone(),
                encoding: Encoding::Numeric {
                    variable: name.clone(),
                    center: 0.0,
                },
                columns: j..j + 1,
            })
            .collect();
        let variables = names.iter().map(CovariateSpec::continuous).collect();
        let strata_labels = strata
            .as_ref()
            .map(|s| {
                let n_strata = s.iter().max().map_or(0, |m| m + 1);
                (0..n_strata).map(|i| format!("stratum {}", i)).collect()
            })
            .unwrap_or_default();

        Ok(Self {
            x,
            column_term: (0..names.len()).collect(),
            layout: DesignLayout {
                blocks,
                column_names: names,
                variables,
                strata: Vec::new(),
            },
            strata,
            strata_labels,
            times: Array1::from(times),
            events,
            row_index: (0..n).collect(),
        })
    }

    pub fn x(&self) -> ArrayView2<'_, f64> {
        self.x.view()
    }

    pub fn n_rows(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.x.ncols()
    }

    pub fn column_names(&self) -> &[String] {
        self.layout.column_names()
    }

    /// the term block that owns column `j`
    pub fn column_term(&self, j: usize) -> &TermBlock {
        &self.layout.blocks[self.column_term[j]]
    }

    pub fn blocks(&self) -> &[TermBlock] {
        self.layout.blocks()
    }

    pub fn layout(&self) -> &DesignLayout {
        &self.layout
    }

    pub fn strata(&self) -> Option<&[usize]> {
        self.strata.as_deref()
    }

    pub fn n_strata(&self) -> usize {
        self.strata_labels.len().max(1)
    }

    pub fn strata_labels(&self) -> &[String] {
        &self.strata_labels
    }

    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    pub fn events(&self) -> &[bool] {
        &self.events
    }

    /// dataset row behind each design row
    pub fn row_index(&self) -> &[usize] {
        &self.row_index
    }

    /// same rows, only the columns of the listed blocks (used for LR tests)
    pub fn select_columns(&self, columns: &[usize]) -> Result<DesignMatrix> {
        if columns.iter().any(|&j| j >= self.n_columns()) {
            return Err(SurvivalError::invalid_dimensions("column index out of bounds"));
        }
        let names = columns.iter().map(|&j| self.column_names()[j].clone()).collect();
        let mut out = DesignMatrix::from_matrix(
            self.x.select(ndarray::Axis(1), columns),
            Some(names),
            self.times.to_vec(),
            self.events.clone(),
            self.strata.clone(),
        )?;
        out.strata_labels = self.strata_labels.clone();
        out.row_index = self.row_index.clone();
        Ok(out)
    }
}

/// expands formulas into design matrices
#[derive(Debug, Clone, Default)]
pub struct DesignBuilder {
    config: DesignConfig,
}

/// build with the default configuration (raw columns, reject missing)
pub fn build(dataset: &Dataset, formula: &Formula) -> Result<DesignMatrix> {
    DesignBuilder::default().build(dataset, formula)
}

impl DesignBuilder {
    pub fn new(config: DesignConfig) -> Self {
        Self { config }
    }

    pub fn with_centering(mut self, centering: Centering) -> Self {
        self.config.centering = centering;
        self
    }

    pub fn with_missing_policy(mut self, missing: MissingPolicy) -> Self {
        self.config.missing = missing;
        self
    }

    pub fn config(&self) -> &DesignConfig {
        &self.config
    }

    pub fn build(&self, dataset: &Dataset, formula: &Formula) -> Result<DesignMatrix> {
        if formula.is_empty() {
            return Err(SurvivalError::formula("formula has no terms"));
        }
        for (i, term) in formula.terms().iter().enumerate() {
            if formula.terms()[..i].iter().any(|t| t.same_as(term)) {
                return Err(SurvivalError::formula(format!("term `{}` appears twice", term)));
            }
        }

        let variables = formula.variables();
        let mut specs = Vec::with_capacity(variables.len());
        for name in &variables {
            let spec = dataset.spec(name).ok_or_else(|| {
                SurvivalError::formula(format!("formula uses unknown covariate `{}`", name))
            })?;
            specs.push(spec.clone());
        }

        let rows = self.included_rows(dataset, &variables)?;
        let expanded = formula.expanded_terms();

        // freeze the encodings on the included rows
        let mut blocks = Vec::with_capacity(expanded.len());
        let mut column_names = Vec::new();
        let mut strata_vars: Vec<(String, Vec<String>)> = Vec::new();
        for term in &expanded {
            let encoding = self.encode_term(term, dataset, &rows, false)?;
            if let Encoding::Strata { variable, levels } = &encoding {
                if !strata_vars.iter().any(|(v, _)| v == variable) {
                    strata_vars.push((variable.clone(), levels.clone()));
                }
            }
            let start = column_names.len();
            column_names.extend(encoding.column_names());
            blocks.push(TermBlock {
                term: term.clone(),
                label: term.to_string(),
                encoding,
                columns: start..column_names.len(),
            });
        }
        if column_names.is_empty() {
            return Err(SurvivalError::formula(
                "formula expands to zero columns - nothing to estimate",
            ));
        }

        let layout = DesignLayout {
            blocks,
            column_names,
            variables: specs,
            strata: strata_vars,
        };
        assemble(dataset, rows, layout)
    }

    /// Encode `dataset` with a layout frozen elsewhere: same knots, levels and
    /// centres, so the columns mean the same thing across datasets.
    pub fn build_with_layout(&self, dataset: &Dataset, layout: &DesignLayout) -> Result<DesignMatrix> {
        for spec in &layout.variables {
            match dataset.spec(&spec.name) {
                Some(current) if current == spec => {}
                Some(_) => {
                    return Err(SurvivalError::schema(format!(
                        "`{}` is declared differently than when the layout was frozen",
                        spec.name
                    )))
                }
                None => {
                    return Err(SurvivalError::formula(format!(
                        "layout uses unknown covariate `{}`",
                        spec.name
                    )))
                }
            }
        }
        let variables: Vec<&str> = layout.variables.iter().map(|s| s.name.as_str()).collect();
        let rows = self.included_rows(dataset, &variables)?;
        assemble(dataset, rows, layout.clone())
    }

    fn included_rows(&self, dataset: &Dataset, variables: &[&str]) -> Result<Vec<usize>> {
        let complete = dataset.complete_case_indices(variables)?;
        let dropped = dataset.n_samples() - complete.len();
        if dropped > 0 {
            match self.config.missing {
                MissingPolicy::Reject => {
                    let counts: Vec<String> = variables
                        .iter()
                        .filter_map(|v| match dataset.missing_count(v) {
                            Some(n) if n > 0 => Some(format!("{} ({})", v, n)),
                            _ => None,
                        })
                        .collect();
                    return Err(SurvivalError::schema(format!(
                        "missing values in {} - impute first or use complete-case analysis",
                        counts.join(", ")
                    )));
                }
                MissingPolicy::CompleteCase => {
                    log::warn!("dropping {} incomplete rows of {}", dropped, dataset.n_samples());
                }
            }
        }
        if complete.is_empty() {
            return Err(SurvivalError::schema("no complete rows left to build a design from"));
        }
        Ok(complete)
    }

    fn encode_term(
        &self,
        term: &Term,
        dataset: &Dataset,
        rows: &[usize],
        in_interaction: bool,
    ) -> Result<Encoding> {
        match term {
            Term::Linear(variable) => {
                let spec = spec_of(dataset, variable)?;
                match &spec.kind {
                    CovariateKind::Continuous => Ok(Encoding::Numeric {
                        variable: variable.clone(),
                        center: self.center_of(dataset, variable, rows),
                    }),
                    CovariateKind::Categorical { levels } => Ok(Encoding::Indicators {
                        variable: variable.clone(),
                        levels: levels.clone(),
                    }),
                    CovariateKind::Stratum { .. } => Err(SurvivalError::formula(format!(
                        "`{}` is a stratification variable - use strat({})",
                        variable, variable
                    ))),
                }
            }
            Term::Spline {
                variable,
                knots,
                locations,
            } => {
                let spec = spec_of(dataset, variable)?;
                if !spec.is_continuous() {
                    return Err(SurvivalError::formula(format!(
                        "spline needs a continuous covariate, `{}` isn't",
                        variable
                    )));
                }
                let spline = match locations {
                    Some(locs) => RestrictedCubicSpline::new(locs.clone())?,
                    None => {
                        let values: Vec<f64> = rows
                            .iter()
                            .filter_map(|&r| dataset.column(variable).and_then(|c| c.numeric(r)))
                            .collect();
                        RestrictedCubicSpline::from_data(&values, *knots, &term.to_string())?
                    }
                };
                Ok(Encoding::Spline {
                    variable: variable.clone(),
                    spline,
                })
            }
            Term::Interaction(a, b) => {
                let left = self.encode_term(a, dataset, rows, true)?;
                let right = self.encode_term(b, dataset, rows, true)?;
                Ok(Encoding::Product(Box::new(left), Box::new(right)))
            }
            Term::Strata(variable) => {
                let spec = spec_of(dataset, variable)?;
                let levels = spec.levels().ok_or_else(|| {
                    SurvivalError::formula(format!(
                        "can't stratify on continuous covariate `{}`",
                        variable
                    ))
                })?;
                if in_interaction {
                    Ok(Encoding::Indicators {
                        variable: variable.clone(),
                        levels: levels.to_vec(),
                    })
                } else {
                    Ok(Encoding::Strata {
                        variable: variable.clone(),
                        levels: levels.to_vec(),
                    })
                }
            }
        }
    }

    fn center_of(&self, dataset: &Dataset, variable: &str, rows: &[usize]) -> f64 {
        match self.config.centering {
            Centering::Raw => 0.0,
            Centering::Mean => {
                let values: Vec<f64> = rows
                    .iter()
                    .filter_map(|&r| dataset.column(variable).and_then(|c| c.numeric(r)))
                    .collect();
                values.iter().sum::<f64>() / values.len().max(1) as f64
            }
        }
    }
}

/// fill the numeric matrix for `rows` under a frozen layout
fn assemble(dataset: &Dataset, rows: Vec<usize>, layout: DesignLayout) -> Result<DesignMatrix> {
    let column_term = layout
        .blocks
        .iter()
        .enumerate()
        .flat_map(|(b, block)| std::iter::repeat(b).take(block.width()))
        .collect();

    let mut x = Array2::zeros((rows.len(), layout.n_columns()));
    let mut buffer = Vec::with_capacity(layout.n_columns());
    for (i, &row) in rows.iter().enumerate() {
        let cell = |name: &str| -> Result<Cell> {
            let value = match dataset.column(name) {
                Some(Column::Continuous(v)) => v[row].map(Cell::Number),
                Some(Column::Categorical(v)) => v[row].map(Cell::Level),
                None => None,
            };
            value.ok_or_else(|| SurvivalError::schema(format!("row {}: `{}` is missing", row, name)))
        };
        buffer.clear();
        for block in &layout.blocks {
            block.encoding.write_row(&cell, &mut buffer)?;
        }
        for (j, v) in buffer.iter().enumerate() {
            x[[i, j]] = *v;
        }
    }

    let (strata, strata_labels) = stratum_ids(dataset, &rows, &layout.strata);

    log::debug!(
        "built design: {} rows x {} columns, {} strata",
        rows.len(),
        layout.n_columns(),
        strata_labels.len().max(1)
    );

    Ok(DesignMatrix {
        x,
        column_term,
        layout,
        strata,
        strata_labels,
        times: rows.iter().map(|&r| dataset.times()[r]).collect(),
        events: rows.iter().map(|&r| dataset.events()[r]).collect(),
        row_index: rows,
    })
}

fn spec_of<'a>(dataset: &'a Dataset, variable: &str) -> Result<&'a CovariateSpec> {
    dataset
        .spec(variable)
        .ok_or_else(|| SurvivalError::formula(format!("formula uses unknown covariate `{}`", variable)))
}

/// combined stratum id per row; ids follow the sorted level-index tuples
fn stratum_ids(
    dataset: &Dataset,
    rows: &[usize],
    strata_vars: &[(String, Vec<String>)],
) -> (Option<Vec<usize>>, Vec<String>) {
    if strata_vars.is_empty() {
        return (None, Vec::new());
    }

    let keys: Vec<Vec<usize>> = rows
        .iter()
        .map(|&r| {
            strata_vars
                .iter()
                .map(|(v, _)| dataset.column(v).and_then(|c| c.numeric(r)).unwrap_or(0.0) as usize)
                .collect()
        })
        .collect();

    let mut ids: BTreeMap<Vec<usize>, usize> = BTreeMap::new();
    for key in &keys {
        ids.entry(key.clone()).or_insert(0);
    }
    for (i, id) in ids.values_mut().enumerate() {
        *id = i;
    }

    let labels = ids
        .keys()
        .map(|key| {
            key.iter()
                .zip(strata_vars)
                .map(|(&l, (v, levels))| format!("{}={}", v, levels[l]))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect();
    let strata = keys.iter().map(|k| ids[k]).collect();
    (Some(strata), labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{validate, RawRecord};
    use approx::assert_relative_eq;

    fn dataset() -> Dataset {
        let specs = vec![
            CovariateSpec::continuous("age"),
            CovariateSpec::continuous("bmi"),
            CovariateSpec::categorical("stage", vec!["I", "II", "III"]),
            CovariateSpec::stratum("site", vec!["north", "south"]),
        ];
        let stages = ["I", "II", "III"];
        let records: Vec<RawRecord> = (0..30)
            .map(|i| {
                RawRecord::new(1.0 + i as f64, (i % 3 != 0) as i64)
                    .with_numeric("age", 40.0 + i as f64)
                    .with_numeric("bmi", 20.0 + (i % 7) as f64)
                    .with_category("stage", stages[i % 3])
                    .with_category("site", if i % 2 == 0 { "north" } else { "south" })
            })
            .collect();
        validate(&records, &specs).unwrap()
    }

    #[test]
    fn test_column_counts_follow_terms() {
        let data = dataset();
        let formula = Formula::new()
            .linear("age")
            .linear("stage")
            .spline("bmi", 4)
            .strata("site");
        let design = build(&data, &formula).unwrap();

        // 1 + 2 + 3 + 0
        assert_eq!(design.n_columns(), 6);
        let declared: usize = design.blocks().iter().map(TermBlock::width).sum();
        assert_eq!(declared, design.n_columns());
        assert_eq!(
            design.column_names(),
            &["age", "stage=II", "stage=III", "bmi", "bmi'", "bmi''"]
        );
        assert_eq!(design.column_term(4).label, "rcs(bmi, 4)");
        assert_eq!(design.n_strata(), 2);
        assert_eq!(design.strata().unwrap()[1], 1);
    }

    #[test]
    fn test_interaction_adds_main_effects_and_products() {
        let data = dataset();
        let formula = Formula::new().interaction(Term::linear("age"), Term::linear("stage"));
        let design = build(&data, &formula).unwrap();

        assert_eq!(design.blocks().len(), 3);
        assert_eq!(design.n_columns(), 1 + 2 + 2);
        assert_eq!(design.column_names()[3], "age * stage=II");
        // row 1 is stage II, age 41
        assert_relative_eq!(design.x()[[1, 3]], 41.0);
        assert_relative_eq!(design.x()[[1, 4]], 0.0);
    }

    #[test]
    fn test_interaction_with_strata_uses_indicators() {
        let data = dataset();
        let formula = Formula::new().interaction(Term::linear("age"), Term::strata("site"));
        let design = build(&data, &formula).unwrap();

        assert_eq!(design.column_names(), &["age", "age * site=south"]);
        assert!(design.strata().is_some());
    }

    #[test]
    fn test_reordering_main_effects_only_permutes_columns() {
        let data = dataset();
        let ab = build(&data, &Formula::new().linear("age").linear("bmi")).unwrap();
        let ba = build(&data, &Formula::new().linear("bmi").linear("age")).unwrap();
        assert_eq!(ab.x().column(0), ba.x().column(1));
        assert_eq!(ab.x().column(1), ba.x().column(0));
    }

    #[test]
    fn test_formula_errors() {
        let data = dataset();
        let bad = [
            Formula::new(),
            Formula::new().linear("weight"),
            Formula::new().linear("site"),
            Formula::new().spline("stage", 3),
            Formula::new().strata("age"),
            Formula::new().strata("site"),
            Formula::new().linear("age").linear("age"),
        ];
        for formula in &bad {
            assert!(
                matches!(build(&data, formula), Err(SurvivalError::Formula { .. })),
                "{} should be rejected",
                formula
            );
        }
    }

    #[test]
    fn test_spline_needs_distinct_values() {
        let data = dataset();
        // bmi takes 7 distinct values
        let err = build(&data, &Formula::new().spline("bmi", 8)).unwrap_err();
        assert!(matches!(err, SurvivalError::InsufficientData { .. }));
    }

    #[test]
    fn test_missing_policy() {
        let specs = vec![CovariateSpec::continuous("x")];
        let records = vec![
            RawRecord::new(1.0, 1).with_numeric("x", 1.0),
            RawRecord::new(2.0, 1).with_missing("x"),
            RawRecord::new(3.0, 0).with_numeric("x", 3.0),
        ];
        let data = validate(&records, &specs).unwrap();
        let formula = Formula::new().linear("x");

        assert!(matches!(build(&data, &formula), Err(SurvivalError::Schema { .. })));

        let design = DesignBuilder::default()
            .with_missing_policy(MissingPolicy::CompleteCase)
            .build(&data, &formula)
            .unwrap();
        assert_eq!(design.row_index(), &[0, 2]);
        assert_eq!(design.events(), &[true, false]);
    }

    #[test]
    fn test_mean_centering() {
        let data = dataset();
        let design = DesignBuilder::default()
            .with_centering(Centering::Mean)
            .build(&data, &Formula::new().linear("age"))
            .unwrap();
        assert_relative_eq!(design.x().column(0).sum(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_layout_encodes_new_rows_like_training_rows() {
        let data = dataset();
        let formula = Formula::new()
            .spline("age", 3)
            .interaction(Term::linear("bmi"), Term::linear("stage"));
        let design = build(&data, &formula).unwrap();

        let row = 7;
        let mut values = HashMap::new();
        for name in ["age", "bmi", "stage"] {
            values.insert(name.to_string(), data.value(row, name).unwrap());
        }
        let encoded = design.layout().encode(&values).unwrap();
        for j in 0..design.n_columns() {
            assert_relative_eq!(encoded[j], design.x()[[row, j]], epsilon = 1e-12);
        }

        values.insert("stage".into(), Value::category("IV"));
        assert!(design.layout().encode(&values).is_err());
    }

    #[test]
    fn test_frozen_layout_keeps_knots_on_another_dataset() {
        let data = dataset();
        let formula = Formula::new().spline("age", 4).linear("stage");
        let first = build(&data, &formula).unwrap();

        // same covariates, ages spread wider so fresh knots would move
        let specs: Vec<CovariateSpec> = data.specs().to_vec();
        let stages = ["I", "II", "III"];
        let records: Vec<RawRecord> = (0..30)
            .map(|i| {
                RawRecord::new(1.0 + i as f64, (i % 3 != 0) as i64)
                    .with_numeric("age", 30.0 + 2.5 * i as f64)
                    .with_numeric("bmi", 20.0 + (i % 7) as f64)
                    .with_category("stage", stages[(i + 1) % 3])
                    .with_category("site", if i % 2 == 0 { "north" } else { "south" })
            })
            .collect();
        let other = validate(&records, &specs).unwrap();

        let fresh = build(&other, &formula).unwrap();
        assert_ne!(fresh.layout(), first.layout());

        let frozen = DesignBuilder::default().build_with_layout(&other, first.layout()).unwrap();
        assert_eq!(frozen.layout(), first.layout());
        assert_eq!(frozen.n_rows(), 30);
        let row = 11;
        let mut values = HashMap::new();
        for name in ["age", "stage"] {
            values.insert(name.to_string(), other.value(row, name).unwrap());
        }
        let encoded = first.layout().encode(&values).unwrap();
        for j in 0..frozen.n_columns() {
            assert_relative_eq!(encoded[j], frozen.x()[[row, j]], epsilon = 1e-12);
        }

        // a redeclared covariate can't reuse the layout
        let narrower = vec![
            CovariateSpec::continuous("age"),
            CovariateSpec::continuous("bmi"),
            CovariateSpec::categorical("stage", vec!["I", "II"]),
            CovariateSpec::stratum("site", vec!["north", "south"]),
        ];
        let records: Vec<RawRecord> = (0..10)
            .map(|i| {
                RawRecord::new(1.0 + i as f64, 1)
                    .with_numeric("age", 40.0 + i as f64)
                    .with_numeric("bmi", 22.0)
                    .with_category("stage", if i % 2 == 0 { "I" } else { "II" })
                    .with_category("site", "north")
            })
            .collect();
        let redeclared = validate(&records, &narrower).unwrap();
        assert!(DesignBuilder::default().build_with_layout(&redeclared, first.layout()).is_err());
    }

    #[test]
    fn test_from_matrix_checks_dimensions() {
        let x = Array2::zeros((3, 2));
        assert!(DesignMatrix::from_matrix(x.clone(), None, vec![1.0, 2.0], vec![true, true], None).is_err());
        assert!(DesignMatrix::from_matrix(x.clone(), None, vec![1.0, 2.0, -1.0], vec![true; 3], None).is_err());
        let design = DesignMatrix::from_matrix(x, None, vec![1.0, 2.0, 3.0], vec![true; 3], None).unwrap();
        assert_eq!(design.column_names(), &["x0", "x1"]);
    }
}
