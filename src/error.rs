use thiserror::Error;

/// Crate-wide error type. Variant names mirror the error kinds a deployment
/// cares about (configuration, transient I/O, parsing, storage, invariants,
/// delivery) rather than the library that raised them.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage constraint violated: {0}")]
    StorageConstraint(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("delivery failure: {0}")]
    Delivery(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// True for the error kinds spec §7 allows a caller to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient(_) | PipelineError::Http(_))
    }
}
