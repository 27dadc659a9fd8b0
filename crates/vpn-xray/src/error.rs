use thiserror::Error;
use vpn_registry::RegistryError;
use vpn_types::ServiceId;

/// A render that cannot produce a complete document. Nothing is emitted and
/// no node is contacted.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Service {service_id} has an invalid endpoint: {message}")]
    InvalidEndpoint { service_id: ServiceId, message: String },

    #[error("Duplicate client id {0} in rendered configuration")]
    DuplicateClient(String),

    #[error("Invalid inbound {tag}: {message}")]
    InvalidInbound { tag: String, message: String },

    #[error("Port {port} is bound both on all interfaces and on {listen}")]
    ListenConflict { port: u16, listen: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, RenderError>;
