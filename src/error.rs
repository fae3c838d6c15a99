use ndarray::Array1;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SurvivalError>;

#[derive(Error, Debug, Clone)]
pub enum SurvivalError {
    #[error("bad input data: {message}")]
    Schema { message: String },

    #[error("can't expand formula: {message}")]
    Formula { message: String },

    #[error("not enough data for {term}: need {required} distinct values, found {found}")]
    InsufficientData {
        term: String,
        required: usize,
        found: usize,
    },

    #[error("newton-raphson didn't converge after {iterations} iterations (score norm {score_norm:.3e})")]
    NonConvergence {
        iterations: usize,
        score_norm: f64,
        last_coefficients: Array1<f64>,
    },

    #[error("information matrix is singular at column `{column}` - collinear or constant within strata?")]
    SingularInformation { column: String },

    #[error("imputing `{variable}` would use {count} predictors (ceiling {ceiling}) - narrow the predictor set")]
    TooManyPredictors {
        variable: String,
        count: usize,
        ceiling: usize,
    },

    #[error("can't pool fits: {message}")]
    DegenerateFit { message: String },

    #[error("dimensions don't match: {message}")]
    InvalidDimensions { message: String },

    #[error("bad parameter: {parameter} = {value}")]
    InvalidParameter { parameter: String, value: String },

    #[error("numerical issues: {message}")]
    NumericalError { message: String },

    #[error("fit cancelled between iterations")]
    Cancelled,

    #[error("bad configuration: {message}")]
    Config { message: String },
}

impl SurvivalError {
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema { message: message.into() }
    }

    pub fn formula(message: impl Into<String>) -> Self {
        Self::Formula { message: message.into() }
    }

    pub fn insufficient_data(term: impl Into<String>, required: usize, found: usize) -> Self {
        Self::InsufficientData {
            term: term.into(),
            required,
            found,
        }
    }

    pub fn singular_information(column: impl Into<String>) -> Self {
        Self::SingularInformation { column: column.into() }
    }

    pub fn degenerate_fit(message: impl Into<String>) -> Self {
        Self::DegenerateFit { message: message.into() }
    }

    pub fn invalid_dimensions(message: impl Into<String>) -> Self {
        Self::InvalidDimensions { message: message.into() }
    }

    pub fn invalid_parameter(parameter: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            value: value.into(),
        }
    }

    pub fn numerical_error(message: impl Into<String>) -> Self {
        Self::NumericalError { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}

impl From<toml::de::Error> for SurvivalError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for SurvivalError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}
