use crate::document::{Client, Inbound, InboundSettings, StreamSettings, TlsSettings, XrayConfig};
use crate::error::{RenderError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use vpn_registry::{client_id, Registry, RenderView};
use vpn_types::{EndpointValidator, NodeId, ServiceProtocol, WILDCARD_LISTEN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XraySettings {
    /// Port used by services that carry no endpoint of their own.
    pub inbound_port: u16,
    pub log_level: String,
    /// SNI advertised by every inbound; `localhost` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
}

impl Default for XraySettings {
    fn default() -> Self {
        Self {
            inbound_port: 443,
            log_level: "warning".to_string(),
            tls_server_name: None,
        }
    }
}

/// An immutable rendered configuration and the nodes it is meant for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub id: u64,
    pub generated_at: DateTime<Utc>,
    pub content: XrayConfig,
    pub content_hash: String,
    pub target_nodes: BTreeSet<NodeId>,
}

/// Lowercase hex SHA-256 over the compact JSON form of the document.
pub fn content_hash(config: &XrayConfig) -> Result<String> {
    let bytes = serde_json::to_vec(config)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Turns a registry view into a snapshot. Snapshot ids are handed out from an
/// in-process counter and never reused.
#[derive(Debug)]
pub struct Synthesizer {
    settings: XraySettings,
    last_id: AtomicU64,
}

impl Synthesizer {
    pub fn new(settings: XraySettings) -> Self {
        Self::resume(settings, 0)
    }

    /// Continue numbering after an already issued snapshot id.
    pub fn resume(settings: XraySettings, last_id: u64) -> Self {
        Self {
            settings,
            last_id: AtomicU64::new(last_id),
        }
    }

    pub fn settings(&self) -> &XraySettings {
        &self.settings
    }

    /// Enforce quotas, take one consistent registry view, and build the
    /// snapshot from it. Fails closed: no snapshot id is consumed on error.
    pub async fn render(&self, registry: &Registry) -> Result<ConfigSnapshot> {
        let view = registry.render_view().await?;
        let content = self.build_document(&view)?;
        let content_hash = content_hash(&content)?;
        let target_nodes = target_nodes(&view);

        let snapshot = ConfigSnapshot {
            id: self.last_id.fetch_add(1, Ordering::SeqCst) + 1,
            generated_at: Utc::now(),
            content,
            content_hash,
            target_nodes,
        };

        info!(
            snapshot_id = snapshot.id,
            clients = snapshot.content.client_count(),
            inbounds = snapshot.content.inbounds.len(),
            targets = snapshot.target_nodes.len(),
            content_hash = %snapshot.content_hash,
            "Rendered configuration snapshot"
        );
        Ok(snapshot)
    }

    /// Pure document construction over an id-ordered view.
    pub fn build_document(&self, view: &RenderView) -> Result<XrayConfig> {
        let mut config = XrayConfig::base(&self.settings.log_level);
        let mut slots: HashMap<(String, u16), usize> = HashMap::new();

        for eligible in &view.services {
            let service = &eligible.service;
            let (listen, port) = match &service.endpoint {
                Some(endpoint) => {
                    let parsed = EndpointValidator::parse(endpoint).map_err(|e| {
                        RenderError::InvalidEndpoint {
                            service_id: service.id,
                            message: e.to_string(),
                        }
                    })?;
                    (parsed.listen_address(), parsed.port)
                }
                None => (WILDCARD_LISTEN.to_string(), self.settings.inbound_port),
            };

            let client = Client {
                id: client_id(&eligible.token.token).to_string(),
                email: format!("svc-{}@user-{}", service.id, service.user_id),
                level: 0,
                limit_ip: service.ip_limit,
                max_concurrent: service.concurrent_limit,
            };

            let index = *slots.entry((listen.clone(), port)).or_insert_with(|| {
                config.inbounds.push(self.inbound(&listen, port));
                config.inbounds.len() - 1
            });
            config.inbounds[index].settings.clients.push(client);
        }

        check_listen_conflicts(&config)?;
        config.validate()?;

        debug!(inbounds = config.inbounds.len(), "Built Xray document");
        Ok(config)
    }

    fn inbound(&self, listen: &str, port: u16) -> Inbound {
        Inbound {
            tag: format!("vless-tls-{}-{}", listen, port),
            listen: listen.to_string(),
            port,
            protocol: ServiceProtocol::XrayVless.xray_protocol().to_string(),
            settings: InboundSettings {
                clients: Vec::new(),
                decryption: "none".to_string(),
            },
            stream_settings: StreamSettings {
                network: "tcp".to_string(),
                security: "tls".to_string(),
                tls_settings: TlsSettings {
                    server_name: self
                        .settings
                        .tls_server_name
                        .clone()
                        .unwrap_or_else(|| "localhost".to_string()),
                },
            },
        }
    }
}

fn check_listen_conflicts(config: &XrayConfig) -> Result<()> {
    let mut by_port: BTreeMap<u16, Vec<&str>> = BTreeMap::new();
    for inbound in &config.inbounds {
        by_port.entry(inbound.port).or_default().push(&inbound.listen);
    }

    for (port, listens) in by_port {
        if listens.len() > 1 && listens.contains(&WILDCARD_LISTEN) {
            let listen = listens
                .iter()
                .find(|l| **l != WILDCARD_LISTEN)
                .map(|l| l.to_string())
                .unwrap_or_default();
            return Err(RenderError::ListenConflict { port, listen });
        }
    }
    Ok(())
}

/// Union of explicit assignments; unassigned services reach every active
/// node. Inactive or unknown nodes are never targeted.
pub fn target_nodes(view: &RenderView) -> BTreeSet<NodeId> {
    let active: BTreeSet<NodeId> = view
        .nodes
        .values()
        .filter(|node| node.is_active)
        .map(|node| node.id)
        .collect();

    let mut targets = BTreeSet::new();
    for eligible in &view.services {
        if eligible.service.node_ids.is_empty() {
            targets.extend(active.iter().copied());
        } else {
            targets.extend(eligible.service.node_ids.intersection(&active).copied());
        }
    }
    targets
}
