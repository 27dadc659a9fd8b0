//! The Xray JSON document pushed to nodes.

use crate::error::{RenderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XrayConfig {
    pub log: LogConfig,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub api: ApiConfig,
    pub policy: PolicyConfig,
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
    pub stream_settings: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundSettings {
    pub clients: Vec<Client>,
    pub decryption: String,
}

/// One service's stanza. Session constraints are omitted when unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub email: String,
    pub level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_ip: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    pub tls_settings: TlsSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    pub protocol: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub services: Vec<String>,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub system: SystemPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPolicy {
    pub stats_inbound_uplink: bool,
    pub stats_inbound_downlink: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsConfig {}

impl XrayConfig {
    /// Skeleton with the fixed sections and no inbounds.
    pub fn base(loglevel: &str) -> Self {
        Self {
            log: LogConfig {
                loglevel: loglevel.to_string(),
            },
            inbounds: Vec::new(),
            outbounds: vec![Outbound {
                protocol: "freedom".to_string(),
                tag: "direct".to_string(),
            }],
            api: ApiConfig {
                services: vec![
                    "HandlerService".to_string(),
                    "StatsService".to_string(),
                    "LoggerService".to_string(),
                ],
                tag: "api".to_string(),
            },
            policy: PolicyConfig {
                system: SystemPolicy {
                    stats_inbound_uplink: true,
                    stats_inbound_downlink: true,
                },
            },
            stats: StatsConfig::default(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.inbounds.iter().map(|i| i.settings.clients.len()).sum()
    }

    /// Structural checks run on every rendered document. A document with no
    /// inbounds is valid: it drops every client from the fleet.
    pub fn validate(&self) -> Result<()> {
        if self.outbounds.is_empty() {
            return Err(RenderError::InvalidInbound {
                tag: "-".to_string(),
                message: "no outbounds configured".to_string(),
            });
        }

        let mut tags = HashSet::new();
        let mut client_ids = HashSet::new();

        for inbound in &self.inbounds {
            if !tags.insert(inbound.tag.as_str()) {
                return Err(RenderError::InvalidInbound {
                    tag: inbound.tag.clone(),
                    message: "duplicate tag".to_string(),
                });
            }

            if inbound.port == 0 {
                return Err(RenderError::InvalidInbound {
                    tag: inbound.tag.clone(),
                    message: "port cannot be 0".to_string(),
                });
            }

            if inbound.settings.clients.is_empty() {
                return Err(RenderError::InvalidInbound {
                    tag: inbound.tag.clone(),
                    message: "no clients".to_string(),
                });
            }

            for client in &inbound.settings.clients {
                if !client_ids.insert(client.id.as_str()) {
                    return Err(RenderError::DuplicateClient(client.id.clone()));
                }
            }
        }

        Ok(())
    }
}
