//! Error types for services and applications.

use sight_com::ComError;
use sight_data::DataError;

/// Errors raised by the service runtime
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Unknown service type: {0}")]
    UnknownType(String),

    #[error(transparent)]
    Com(#[from] ComError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<toml::de::Error> for ServiceError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
