use thiserror::Error;
use vpn_types::CommonError;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("Insufficient wallet balance: {balance} available, {price} required")]
    InsufficientFunds { balance: i64, price: i64 },

    #[error("Operation not permitted: {0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        RegistryError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        RegistryError::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }
}

impl From<CommonError> for RegistryError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Validation { field, message } => RegistryError::Validation { field, message },
            CommonError::NotFound { resource, id } => RegistryError::NotFound { resource, id },
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
