use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use vpn_fleet::FleetError;
use vpn_registry::RegistryError;
use vpn_xray::RenderError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    InsufficientFunds(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::QuotaExceeded(_) => StatusCode::CONFLICT,
            ApiError::InsufficientFunds(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::InvalidState(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation { .. } => ApiError::Validation(err.to_string()),
            RegistryError::QuotaExceeded(_) => ApiError::QuotaExceeded(err.to_string()),
            RegistryError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            RegistryError::InsufficientFunds { .. } => ApiError::InsufficientFunds(err.to_string()),
            RegistryError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
            RegistryError::Storage(_) | RegistryError::Io(_) | RegistryError::Json(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<RenderError> for ApiError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Registry(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::InvalidState(message) => ApiError::InvalidState(message),
            FleetError::Render(inner) => inner.into(),
            FleetError::Registry(inner) => inner.into(),
            FleetError::Storage(_) | FleetError::Internal(_) => ApiError::Internal(err.to_string()),
        }
    }
}
