use thiserror::Error;

pub type Result<T> = std::result::Result<T, KungpaoError>;

#[derive(Debug, Error)]
pub enum KungpaoError {
    #[error("bad input pattern: {0}")]
    BadPattern(#[from] glob::PatternError),
    #[error("unreadable path: {0}")]
    UnreadablePath(#[from] glob::GlobError),
    #[error("{0}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    YAMLError(#[from] serde_yaml::Error),
    #[error("{0}")]
    JSONError(#[from] serde_json::Error),
    #[error("request failed: {0}")]
    HttpError(#[from] ureq::Error),
    #[error("{0}")]
    InvalidFITS(String),
    #[error("{0}")]
    LinalgError(String),
    #[error("invalid lower and upper limits: ({lower}, {upper})")]
    InvalidRange { lower: f64, upper: f64 },
    #[error("x and y should have the same size ({x} != {y})")]
    LengthMismatch { x: usize, y: usize },
    #[error("{0} cannot be used to seed a random generator; expected none, an integer, \
             a list of integers or an existing generator")]
    InvalidSeed(String),
    #[error("{what} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: [usize; 2],
        found: [usize; 2],
    },
    #[error("redshift must be >= 0, got {0}")]
    NegativeRedshift(f64),
    #[error("{0}")]
    Background(String),
    #[error("{0}")]
    Wcs(String),
    #[error("{0}")]
    Catalog(String),
    #[error("{0}")]
    Plot(String),
    #[error("{0}")]
    Isophote(String),
}

#[cfg(feature = "python")]
impl From<KungpaoError> for pyo3::PyErr {
    fn from(value: KungpaoError) -> Self {
        use pyo3::exceptions::{PyIOError, PyValueError};
        match value {
            KungpaoError::IOError(e) => PyIOError::new_err(e.to_string()),
            KungpaoError::HttpError(e) => PyIOError::new_err(e.to_string()),
            other => PyValueError::new_err(other.to_string()),
        }
    }
}
