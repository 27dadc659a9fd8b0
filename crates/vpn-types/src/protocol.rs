//! Service protocol

use serde::{Deserialize, Serialize};

/// Protocols a service can be provisioned with.
///
/// Only VLESS served by Xray exists today; the wire name `XRAY_VLESS` is what
/// dashboards send and receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceProtocol {
    #[default]
    XrayVless,
}

impl ServiceProtocol {
    /// Protocol name inside an Xray inbound
    pub fn xray_protocol(&self) -> &'static str {
        match self {
            ServiceProtocol::XrayVless => "vless",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceProtocol::XrayVless => "XRAY_VLESS",
        }
    }
}

impl std::fmt::Display for ServiceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
