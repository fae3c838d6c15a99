use std::collections::{HashMap, HashSet};

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SurvivalError};

/// one covariate value as handed over by the loader
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Numeric(f64),
    Category(String),
    /// explicit missing marker - never encoded as 0 or ""
    Missing,
}

impl Value {
    pub fn category(label: impl Into<String>) -> Self {
        Self::Category(label.into())
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }
}

/// event indicator after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Event,
    Censored,
}

/// maps raw status codes onto the two-value domain - the event code is always declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCoding {
    pub event: i64,
    pub censored: i64,
}

impl StatusCoding {
    pub fn new(event: i64, censored: i64) -> Result<Self> {
        if event == censored {
            return Err(SurvivalError::schema(format!(
                "event and censored codes must differ (both {})",
                event
            )));
        }
        Ok(Self { event, censored })
    }

    pub fn decode(&self, code: i64) -> Result<Status> {
        if code == self.event {
            Ok(Status::Event)
        } else if code == self.censored {
            Ok(Status::Censored)
        } else {
            Err(SurvivalError::schema(format!(
                "status code {} is neither event ({}) nor censored ({})",
                code, self.event, self.censored
            )))
        }
    }
}

/// 1 = event, 0 = censored
impl Default for StatusCoding {
    fn default() -> Self {
        Self { event: 1, censored: 0 }
    }
}

/// one subject before validation
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub values: HashMap<String, Value>,
    pub time: f64,
    pub status: i64,
}

impl RawRecord {
    pub fn new(time: f64, status: i64) -> Self {
        Self {
            values: HashMap::new(),
            time,
            status,
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_numeric(self, name: impl Into<String>, value: f64) -> Self {
        self.with_value(name, Value::Numeric(value))
    }

    pub fn with_category(self, name: impl Into<String>, label: impl Into<String>) -> Self {
        self.with_value(name, Value::Category(label.into()))
    }

    pub fn with_missing(self, name: impl Into<String>) -> Self {
        self.with_value(name, Value::Missing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovariateKind {
    Continuous,
    /// first level is the reference
    Categorical { levels: Vec<String> },
    /// only usable for stratification (or interacting with a stratified term)
    Stratum { levels: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovariateSpec {
    pub name: String,
    pub kind: CovariateKind,
}

impl CovariateSpec {
    pub fn continuous(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CovariateKind::Continuous,
        }
    }

    pub fn categorical<S: Into<String>>(name: impl Into<String>, levels: Vec<S>) -> Self {
        Self {
            name: name.into(),
            kind: CovariateKind::Categorical {
                levels: levels.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn stratum<S: Into<String>>(name: impl Into<String>, levels: Vec<S>) -> Self {
        Self {
            name: name.into(),
            kind: CovariateKind::Stratum {
                levels: levels.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn levels(&self) -> Option<&[String]> {
        match &self.kind {
            CovariateKind::Continuous => None,
            CovariateKind::Categorical { levels } | CovariateKind::Stratum { levels } => {
                Some(levels)
            }
        }
    }

    pub fn reference_level(&self) -> Option<&str> {
        self.levels().and_then(|l| l.first()).map(String::as_str)
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self.kind, CovariateKind::Continuous)
    }

    pub fn is_stratum(&self) -> bool {
        matches!(self.kind, CovariateKind::Stratum { .. })
    }
}

/// what to do with a category label that isn't in the declared level set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnseenLevelPolicy {
    #[default]
    Reject,
    TreatAsMissing,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    pub unseen_levels: UnseenLevelPolicy,
    pub status_coding: StatusCoding,
}

/// validated column - categorical values are stored as level indices
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Continuous(Vec<Option<f64>>),
    Categorical(Vec<Option<usize>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Continuous(v) => v.len(),
            Column::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            Column::Continuous(v) => v[row].is_none(),
            Column::Categorical(v) => v[row].is_none(),
        }
    }

    pub fn n_missing(&self) -> usize {
        (0..self.len()).filter(|&i| self.is_missing(i)).count()
    }

    /// numeric view - categorical levels come back as their index
    pub fn numeric(&self, row: usize) -> Option<f64> {
        match self {
            Column::Continuous(v) => v[row],
            Column::Categorical(v) => v[row].map(|l| l as f64),
        }
    }

    fn select(&self, indices: &[usize]) -> Column {
        match self {
            Column::Continuous(v) => Column::Continuous(indices.iter().map(|&i| v[i]).collect()),
            Column::Categorical(v) => {
                Column::Categorical(indices.iter().map(|&i| v[i]).collect())
            }
        }
    }
}

/// validated survival data - immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    specs: Vec<CovariateSpec>,
    columns: Vec<Column>,
    times: Array1<f64>,
    events: Vec<bool>,
}

/// Validate raw records against covariate specs with default options.
///
/// Status is read as 1 = event, 0 = censored. Any other code is a schema
/// error, so data coded 1/2 fails here instead of being misread; use
/// [`validate_coded`] or [`validate_with`] to declare the event code.
pub fn validate(records: &[RawRecord], specs: &[CovariateSpec]) -> Result<Dataset> {
    validate_with(records, specs, &ValidationOptions::default())
}

/// [`validate`] with the event and censored codes spelled out
pub fn validate_coded(records: &[RawRecord], specs: &[CovariateSpec], coding: StatusCoding) -> Result<Dataset> {
    let options = ValidationOptions {
        status_coding: coding,
        ..Default::default()
    };
    validate_with(records, specs, &options)
}

pub fn validate_with(
    records: &[RawRecord],
    specs: &[CovariateSpec],
    options: &ValidationOptions,
) -> Result<Dataset> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name.as_str()) {
            return Err(SurvivalError::schema(format!(
                "covariate `{}` declared twice",
                spec.name
            )));
        }
        if let Some(levels) = spec.levels() {
            if levels.is_empty() {
                return Err(SurvivalError::schema(format!(
                    "`{}` declares no levels",
                    spec.name
                )));
            }
            let distinct: HashSet<&String> = levels.iter().collect();
            if distinct.len() != levels.len() {
                return Err(SurvivalError::schema(format!(
                    "`{}` has duplicate levels",
                    spec.name
                )));
            }
        }
    }

    let n = records.len();
    let mut times = Vec::with_capacity(n);
    let mut events = Vec::with_capacity(n);
    let mut columns: Vec<Column> = specs
        .iter()
        .map(|spec| match spec.kind {
            CovariateKind::Continuous => Column::Continuous(Vec::with_capacity(n)),
            _ => Column::Categorical(Vec::with_capacity(n)),
        })
        .collect();

    for (row, record) in records.iter().enumerate() {
        if !record.time.is_finite() || record.time <= 0.0 {
            return Err(SurvivalError::schema(format!(
                "record {}: time must be positive & finite, got {}",
                row, record.time
            )));
        }
        let status = options
            .status_coding
            .decode(record.status)
            .map_err(|e| SurvivalError::schema(format!("record {}: {}", row, e)))?;

        if let Some(unknown) = record.values.keys().find(|k| !seen.contains(k.as_str())) {
            return Err(SurvivalError::schema(format!(
                "record {}: undeclared covariate `{}`",
                row, unknown
            )));
        }

        for (spec, column) in specs.iter().zip(columns.iter_mut()) {
            let value = record.values.get(&spec.name).unwrap_or(&Value::Missing);
            match (column, value) {
                (Column::Continuous(col), Value::Numeric(v)) => {
                    if !v.is_finite() {
                        return Err(SurvivalError::schema(format!(
                            "record {}: `{}` = {} - use Value::Missing for unknown values",
                            row, spec.name, v
                        )));
                    }
                    col.push(Some(*v));
                }
                (Column::Continuous(col), Value::Missing) => col.push(None),
                (Column::Categorical(col), Value::Missing) => col.push(None),
                (Column::Categorical(col), Value::Category(label)) => {
                    let levels = spec.levels().unwrap_or(&[]);
                    match levels.iter().position(|l| l == label) {
                        Some(idx) => col.push(Some(idx)),
                        None => match options.unseen_levels {
                            UnseenLevelPolicy::TreatAsMissing => col.push(None),
                            UnseenLevelPolicy::Reject => {
                                return Err(SurvivalError::schema(format!(
                                    "record {}: `{}` has unknown level `{}`",
                                    row, spec.name, label
                                )));
                            }
                        },
                    }
                }
                (_, other) => {
                    return Err(SurvivalError::schema(format!(
                        "record {}: `{}` got {:?}, which doesn't fit its declared kind",
                        row, spec.name, other
                    )));
                }
            }
        }

        times.push(record.time);
        events.push(status == Status::Event);
    }

    Ok(Dataset {
        specs: specs.to_vec(),
        columns,
        times: Array1::from(times),
        events,
    })
}

impl Dataset {
    /// how many subjects
    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    pub fn n_covariates(&self) -> usize {
        self.specs.len()
    }

    pub fn n_events(&self) -> usize {
        self.events.iter().filter(|&&e| e).count()
    }

    pub fn specs(&self) -> &[CovariateSpec] {
        &self.specs
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    pub fn spec(&self, name: &str) -> Option<&CovariateSpec> {
        self.index_of(name).map(|i| &self.specs[i])
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// survival/censoring times
    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    /// event indicators (true = event, false = censored)
    pub fn events(&self) -> &[bool] {
        &self.events
    }

    pub fn missing_count(&self, name: &str) -> Option<usize> {
        self.column(name).map(Column::n_missing)
    }

    pub fn total_missing(&self) -> usize {
        self.columns.iter().map(Column::n_missing).sum()
    }

    pub fn has_missing(&self) -> bool {
        self.columns.iter().any(|c| c.n_missing() > 0)
    }

    /// rows with no missing value among `names`
    pub fn complete_case_indices(&self, names: &[&str]) -> Result<Vec<usize>> {
        let cols = names
            .iter()
            .map(|n| {
                self.column(n)
                    .ok_or_else(|| SurvivalError::schema(format!("unknown covariate `{}`", n)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((0..self.n_samples())
            .filter(|&i| cols.iter().all(|c| !c.is_missing(i)))
            .collect())
    }

    /// the value of one cell, decoded back to its label for categorical kinds
    pub fn value(&self, row: usize, name: &str) -> Option<Value> {
        let idx = self.index_of(name)?;
        if row >= self.n_samples() {
            return None;
        }
        Some(match &self.columns[idx] {
            Column::Continuous(v) => v[row].map_or(Value::Missing, Value::Numeric),
            Column::Categorical(v) => match v[row] {
                Some(level) => {
                    Value::Category(self.specs[idx].levels().unwrap_or(&[])[level].clone())
                }
                None => Value::Missing,
            },
        })
    }

    /// grab a subset of subjects by indices
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        if indices.iter().any(|&i| i >= self.n_samples()) {
            return Err(SurvivalError::invalid_dimensions("subset index out of bounds"));
        }

        Ok(Self {
            specs: self.specs.clone(),
            columns: self.columns.iter().map(|c| c.select(indices)).collect(),
            times: indices.iter().map(|&i| self.times[i]).collect(),
            events: indices.iter().map(|&i| self.events[i]).collect(),
        })
    }

    /// new dataset with `level` moved to the front of `name`'s level list
    pub fn with_reference_level(&self, name: &str, level: &str) -> Result<Self> {
        let idx = self
            .index_of(name)
            .ok_or_else(|| SurvivalError::schema(format!("unknown covariate `{}`", name)))?;
        let levels = self.specs[idx].levels().ok_or_else(|| {
            SurvivalError::schema(format!("`{}` is continuous - it has no reference level", name))
        })?;
        let old_pos = levels.iter().position(|l| l == level).ok_or_else(|| {
            SurvivalError::schema(format!("`{}` has no level `{}`", name, level))
        })?;

        let mut reordered = levels.to_vec();
        let moved = reordered.remove(old_pos);
        reordered.insert(0, moved);
        // old index -> new index
        let remap: Vec<usize> = levels
            .iter()
            .map(|l| reordered.iter().position(|r| r == l).unwrap_or(0))
            .collect();

        let mut out = self.clone();
        out.specs[idx].kind = match &self.specs[idx].kind {
            CovariateKind::Stratum { .. } => CovariateKind::Stratum { levels: reordered },
            _ => CovariateKind::Categorical { levels: reordered },
        };
        if let Column::Categorical(values) = &self.columns[idx] {
            out.columns[idx] = Column::Categorical(
                values.iter().map(|v| v.map(|l| remap[l])).collect(),
            );
        }
        Ok(out)
    }

    /// swap in a completed column (used by the imputation engine)
    pub(crate) fn replace_column(&mut self, index: usize, column: Column) {
        debug_assert_eq!(column.len(), self.n_samples());
        self.columns[index] = column;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<CovariateSpec> {
        vec![
            CovariateSpec::continuous("age"),
            CovariateSpec::categorical("sex", vec!["female", "male"]),
        ]
    }

    fn records() -> Vec<RawRecord> {
        vec![
            RawRecord::new(1.0, 1).with_numeric("age", 50.0).with_category("sex", "male"),
            RawRecord::new(2.0, 0).with_numeric("age", 61.0).with_category("sex", "female"),
            RawRecord::new(3.0, 1).with_missing("age").with_category("sex", "male"),
            RawRecord::new(4.0, 1).with_numeric("age", 45.0),
        ]
    }

    #[test]
    fn test_validate_builds_columns() {
        let data = validate(&records(), &specs()).unwrap();
        assert_eq!(data.n_samples(), 4);
        assert_eq!(data.n_events(), 3);
        assert_eq!(data.events(), &[true, false, true, true]);
        assert_eq!(data.missing_count("age"), Some(1));
        // omitted covariate counts as missing
        assert_eq!(data.missing_count("sex"), Some(1));
        assert_eq!(data.value(0, "sex"), Some(Value::category("male")));
        assert_eq!(data.value(2, "age"), Some(Value::Missing));
    }

    #[test]
    fn test_invalid_times() {
        let recs = vec![RawRecord::new(0.0, 1).with_numeric("age", 1.0)];
        assert!(matches!(
            validate(&recs, &specs()),
            Err(SurvivalError::Schema { .. })
        ));
        let recs = vec![RawRecord::new(-1.0, 1)];
        assert!(validate(&recs, &specs()).is_err());
    }

    #[test]
    fn test_status_outside_domain() {
        let recs = vec![RawRecord::new(1.0, 2)];
        assert!(matches!(
            validate(&recs, &specs()),
            Err(SurvivalError::Schema { .. })
        ));

        let options = ValidationOptions {
            status_coding: StatusCoding::new(2, 1).unwrap(),
            ..Default::default()
        };
        let data = validate_with(&recs, &specs(), &options).unwrap();
        assert_eq!(data.events(), &[true]);
    }

    #[test]
    fn test_one_two_status_coding_must_be_declared() {
        // 2 = death, 1 = alive
        let recs: Vec<RawRecord> = [2, 1, 2].iter().map(|&s| RawRecord::new(1.0, s)).collect();
        assert!(matches!(
            validate(&recs, &specs()),
            Err(SurvivalError::Schema { .. })
        ));

        let data = validate_coded(&recs, &specs(), StatusCoding::new(2, 1).unwrap()).unwrap();
        assert_eq!(data.events(), &[true, false, true]);
        assert_eq!(data.n_events(), 2);

        let default_coded: Vec<RawRecord> = [0, 1].iter().map(|&s| RawRecord::new(1.0, s)).collect();
        let data = validate(&default_coded, &specs()).unwrap();
        assert_eq!(data.events(), &[false, true]);
    }

    #[test]
    fn test_unseen_level_policy() {
        let recs = vec![RawRecord::new(1.0, 1).with_category("sex", "other")];
        assert!(validate(&recs, &specs()).is_err());

        let options = ValidationOptions {
            unseen_levels: UnseenLevelPolicy::TreatAsMissing,
            ..Default::default()
        };
        let data = validate_with(&recs, &specs(), &options).unwrap();
        assert_eq!(data.missing_count("sex"), Some(1));
    }

    #[test]
    fn test_kind_mismatch_and_unknown_covariate() {
        let recs = vec![RawRecord::new(1.0, 1).with_numeric("sex", 1.0)];
        assert!(validate(&recs, &specs()).is_err());

        let recs = vec![RawRecord::new(1.0, 1).with_numeric("weight", 80.0)];
        assert!(validate(&recs, &specs()).is_err());

        let recs = vec![RawRecord::new(1.0, 1).with_numeric("age", f64::NAN)];
        assert!(validate(&recs, &specs()).is_err());
    }

    #[test]
    fn test_reference_level_change_is_a_new_dataset() {
        let data = validate(&records(), &specs()).unwrap();
        let flipped = data.with_reference_level("sex", "male").unwrap();

        assert_eq!(data.spec("sex").unwrap().reference_level(), Some("female"));
        assert_eq!(flipped.spec("sex").unwrap().reference_level(), Some("male"));
        // labels survive the re-indexing
        for row in 0..data.n_samples() {
            assert_eq!(data.value(row, "sex"), flipped.value(row, "sex"));
        }
        assert!(data.with_reference_level("age", "x").is_err());
    }

    #[test]
    fn test_subset_and_complete_cases() {
        let data = validate(&records(), &specs()).unwrap();
        assert_eq!(data.complete_case_indices(&["age", "sex"]).unwrap(), vec![0, 1]);

        let subset = data.subset(&[0, 2]).unwrap();
        assert_eq!(subset.n_samples(), 2);
        assert_eq!(subset.times()[1], 3.0);
        assert!(data.subset(&[10]).is_err());
    }
}
