//! Common error types shared across crates

use thiserror::Error;

/// Common result type
pub type Result<T> = std::result::Result<T, CommonError>;

/// Model-level failures raised before anything is persisted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Malformed or missing input
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    /// Unknown identifier
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },
}

impl CommonError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CommonError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        CommonError::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }
}
