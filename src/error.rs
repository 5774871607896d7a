use thiserror::Error;

use crate::cache::BackendError;

/// Errors surfaced by the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("validation failed: {message}")]
    Validation { message: String },
    #[error("storage backend failure: {0}")]
    Backend(#[from] BackendError),
    #[error("record source failure: {message}")]
    RecordSource { message: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl CacheError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn record_source(message: impl Into<String>) -> Self {
        Self::RecordSource {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
