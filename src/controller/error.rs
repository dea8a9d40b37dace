//! Error types for the replica controller and the operations it drives

use std::time::Duration;

use thiserror::Error;

use crate::crd::FieldError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
/// This is idiomatic for error enums and improves readability at call sites.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid queue key {0:?}, expected namespace/name")]
    InvalidKey(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid field: {0}")]
    FieldError(#[from] FieldError),

    /// The exec channel itself failed (no stdout, stream error, ...)
    #[error("Failed to execute command in pod: {0}")]
    ExecError(String),

    /// The command ran but wrote to stderr
    #[error("Command failed: {0}")]
    CommandError(String),

    #[error("no pods found for instance {0}")]
    NoPodsFound(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("ConfigMap {0} is missing the Patroni config annotation")]
    MissingConfigAnnotation(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::NotFound(_) => true, // Resource might appear later
            Error::NoPodsFound(_) => true,
            Error::ExecError(_) => true,
            Error::CommandError(_) => true,
            Error::IoError(_) => true,
            Error::Timeout(_) => true,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::InvalidKey(_) => false,
            Error::ValidationError(_) => false,
            Error::FieldError(_) => false,
            Error::MissingConfigAnnotation(_) => false,
        }
    }

    /// Whether this is a 404 from the API server or a missing dependent object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let max_secs = self.max_delay.as_secs_f64();

        // Cap before applying jitter: powi overflows to infinity for large attempts
        let base_delay_secs =
            (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(max_secs);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(max_secs);

        Duration::from_secs_f64(capped_delay)
    }
}
