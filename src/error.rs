//! Error types for the telemetry operator

use thiserror::Error;

use crate::controller::secret_ref::ReferenceError;

/// Result type used throughout the operator
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Failed to synthesize collector configuration: {0}")]
    SynthesisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Reference error: {0}")]
    ReferenceError(#[from] ReferenceError),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Failed to scrape collector metrics: {0}")]
    ScrapeError(String),

    #[error("Deletion blocked: {0}")]
    DeletionBlocked(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

impl Error {
    /// Whether the scheduler should retry the failed pass with a short backoff
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 || e.code == 429 || e.code >= 500,
            Error::KubeError(_) => true,
            Error::HttpError(_) | Error::ScrapeError(_) => true,
            Error::ReferenceError(e) => e.is_transient(),
            Error::DeletionBlocked(_) => true,
            Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::SynthesisError(_)
            | Error::SerializationError(_)
            | Error::YamlError(_)
            | Error::MissingField(_) => false,
        }
    }

    /// Short label used for the reconcile error metric
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::SynthesisError(_) => "synthesis",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::ReferenceError(_) => "reference",
            Error::HttpError(_) | Error::ScrapeError(_) => "http",
            Error::DeletionBlocked(_) => "deletion_blocked",
            Error::MissingField(_) => "missing_field",
        }
    }
}
