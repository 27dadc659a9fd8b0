use std::time::Duration;
use thiserror::Error;
use vpn_registry::RegistryError;
use vpn_xray::RenderError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Render failed: {0}")]
    Render(#[from] RenderError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Why a single node did not accept a snapshot. Recorded in the apply
/// result, never returned from `apply` itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("node is inactive")]
    Inactive,

    #[error("node is no longer registered")]
    Missing,
}
