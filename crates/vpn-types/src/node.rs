//! Gateway nodes of the fleet

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::NodeId;

/// A gateway node as stored by the registry.
///
/// Never serialize this to a dashboard: use [`Node::view`], which masks the
/// auth token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub location: String,
    pub ip_address: String,
    pub api_base_url: String,
    pub auth_token: String,
    pub is_active: bool,
    /// Updated only by a successful config push
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn view(&self) -> NodeView {
        NodeView {
            id: self.id,
            name: self.name.clone(),
            location: self.location.clone(),
            ip_address: self.ip_address.clone(),
            api_base_url: self.api_base_url.clone(),
            auth_token: mask_secret(&self.auth_token),
            is_active: self.is_active,
            last_seen_at: self.last_seen_at,
            created_at: self.created_at,
        }
    }
}

/// Dashboard-facing node with the auth token redacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: NodeId,
    pub name: String,
    pub location: String,
    pub ip_address: String,
    pub api_base_url: String,
    pub auth_token: String,
    pub is_active: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub location: String,
    pub ip_address: String,
    pub api_base_url: String,
    pub auth_token: String,
}

/// Keep the first four characters of a secret and star out the rest
pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}
