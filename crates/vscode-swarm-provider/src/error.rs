//! Error types for the provider crate.

use thiserror::Error;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Invalid provider or instance configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backend was unreachable or rejected the operation.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The instance is not known to this provider.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// A backend operation did not finish in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The provider does not support the operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// Backend output could not be parsed.
    #[error("Malformed backend response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ProviderError {
    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_) | Self::KubeApi(_))
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Config(_) => 400,
            Self::Unsupported(_) => 501,
            Self::Parse(_) => 502,
            Self::Backend(_) | Self::Timeout(_) | Self::KubeApi(_) => 503,
        }
    }
}

/// A specialized Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
