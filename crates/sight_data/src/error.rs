//! Error types for data objects.

/// Errors raised while creating or accessing data objects
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataError {
    #[error("Unknown data type: {0}")]
    UnknownType(String),

    #[error("Invalid value for {type_name}: {reason}")]
    InvalidValue { type_name: String, reason: String },

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Result type for data operations
pub type DataResult<T> = Result<T, DataError>;
