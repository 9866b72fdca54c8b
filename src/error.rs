use thiserror::Error;

/// Every failure the engine can report to a caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Malformed table, grid or argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Interpolation requested outside the tabulated domain.
    #[error("value {value} is outside of the domain [{min}, {max}] of {what}")]
    OutOfRange {
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Physically inconsistent cosmological or survey parameters.
    #[error("parameter out of range: {0}")]
    ParameterRange(String),

    /// A correlation, multipole or covariance was requested with no physical terms enabled.
    #[error("no contributions to the correlation function are enabled")]
    NoContributions,

    /// A bulk computation was requested over an empty grid.
    #[error("the {0} grid is empty")]
    EmptyGrid(&'static str),

    /// Numerical integration did not converge, even after relaxing the tolerance.
    #[error("integration of {what} did not converge (estimated error {error:e})")]
    Integration { what: String, error: f64 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn out_of_range(what: &'static str, value: f64, min: f64, max: f64) -> Self {
        Error::OutOfRange {
            what,
            value,
            min,
            max,
        }
    }
}
