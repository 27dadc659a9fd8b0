//! Services: per-user VPN access grants

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{NodeId, ResellerId, ServiceId, ServiceProtocol, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub user_id: UserId,
    pub reseller_id: Option<ResellerId>,
    pub protocol: ServiceProtocol,
    /// `host:port` the inbound listens on and clients connect to
    pub endpoint: Option<String>,
    pub traffic_limit_bytes: Option<u64>,
    /// Monotonic counter fed by traffic accounting
    pub traffic_used_bytes: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub ip_limit: Option<u32>,
    pub concurrent_limit: Option<u32>,
    pub is_active: bool,
    #[serde(default)]
    pub node_ids: BTreeSet<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl Service {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    pub fn is_over_quota(&self) -> bool {
        matches!(self.traffic_limit_bytes, Some(limit) if self.traffic_used_bytes >= limit)
    }

    /// The value `is_active` must hold: not expired and under its traffic limit
    pub fn should_be_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_over_quota()
    }

    /// Whether the service belongs in a rendered configuration right now
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.should_be_active(now)
    }

    pub fn remaining_bytes(&self) -> Option<u64> {
        self.traffic_limit_bytes
            .map(|limit| limit.saturating_sub(self.traffic_used_bytes))
    }
}

/// Creation request for a service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewService {
    pub name: String,
    pub user_id: UserId,
    #[serde(default)]
    pub reseller_id: Option<ResellerId>,
    #[serde(default)]
    pub protocol: ServiceProtocol,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub traffic_limit_bytes: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ip_limit: Option<u32>,
    #[serde(default)]
    pub concurrent_limit: Option<u32>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Full replacement of the editable fields of a service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceUpdate {
    pub name: String,
    #[serde(default)]
    pub protocol: ServiceProtocol,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub traffic_limit_bytes: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ip_limit: Option<u32>,
    #[serde(default)]
    pub concurrent_limit: Option<u32>,
}

/// Opaque per-service credential; exactly one per service, never rotated implicitly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionToken {
    pub id: u64,
    pub token: String,
    pub service_id: ServiceId,
    pub created_at: DateTime<Utc>,
}
