//! Transport used to deliver a snapshot to one node.

use crate::error::PushError;
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use vpn_types::Node;
use vpn_xray::{ConfigSnapshot, XrayConfig};

pub const DEFAULT_APPLY_PATH: &str = "/agent/config/apply";
pub const NODE_TOKEN_HEADER: &str = "X-Node-Token";

/// Longest response-body excerpt kept in a failure message.
const BODY_EXCERPT_LEN: usize = 200;

/// JSON body posted to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyRequest {
    pub snapshot_id: u64,
    pub content_hash: String,
    pub config: XrayConfig,
}

impl From<&ConfigSnapshot> for ApplyRequest {
    fn from(snapshot: &ConfigSnapshot) -> Self {
        Self {
            snapshot_id: snapshot.id,
            content_hash: snapshot.content_hash.clone(),
            config: snapshot.content.clone(),
        }
    }
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Deliver the request; `Ok` means the node accepted and activated it.
    async fn push(&self, node: &Node, request: &ApplyRequest) -> Result<(), PushError>;
}

/// Pushes over HTTP to `<api_base_url><apply_path>`, authenticating with the
/// node's token header. Any 2xx counts as accepted.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    http: reqwest::Client,
    apply_path: String,
}

impl HttpNodeClient {
    pub fn new(apply_path: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), apply_path)
    }

    pub fn with_client(http: reqwest::Client, apply_path: impl Into<String>) -> Self {
        let apply_path = apply_path.into();
        let apply_path = if apply_path.starts_with('/') {
            apply_path
        } else {
            format!("/{}", apply_path)
        };
        Self { http, apply_path }
    }

    fn endpoint(&self, node: &Node) -> String {
        format!("{}{}", node.api_base_url.trim_end_matches('/'), self.apply_path)
    }
}

impl Default for HttpNodeClient {
    fn default() -> Self {
        Self::new(DEFAULT_APPLY_PATH)
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn push(&self, node: &Node, request: &ApplyRequest) -> Result<(), PushError> {
        let url = self.endpoint(node);
        debug!(node_id = node.id, url = %url, snapshot_id = request.snapshot_id, "Pushing snapshot");

        let response = self
            .http
            .post(&url)
            .header(NODE_TOKEN_HEADER, &node.auth_token)
            .json(request)
            .send()
            .await
            .map_err(|e| PushError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(PushError::Rejected {
            status: status.as_u16(),
            body: body.chars().take(BODY_EXCERPT_LEN).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_endpoint_joins_base_and_path() {
        let node = Node {
            id: 1,
            name: "edge".to_string(),
            location: "Oslo".to_string(),
            ip_address: "192.0.2.5".to_string(),
            api_base_url: "http://192.0.2.5:9000/".to_string(),
            auth_token: "secret".to_string(),
            is_active: true,
            last_seen_at: None,
            created_at: Utc::now(),
        };

        assert_eq!(
            HttpNodeClient::default().endpoint(&node),
            "http://192.0.2.5:9000/agent/config/apply"
        );
        assert_eq!(
            HttpNodeClient::new("reload").endpoint(&node),
            "http://192.0.2.5:9000/reload"
        );
    }
}
