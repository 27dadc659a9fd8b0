//! Reseller capacity plans

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::PlanId;

/// A reseller's purchasable capacity ceiling.
///
/// `None` on any `max_*` field means the plan does not cap that dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub price: i64,
    pub duration_days: u32,
    pub max_users: Option<u32>,
    pub max_services: Option<u32>,
    pub max_traffic_bytes: Option<u64>,
    pub max_concurrent_total: Option<u32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub name: String,
    #[serde(default)]
    pub price: i64,
    #[serde(default = "default_duration_days")]
    pub duration_days: u32,
    #[serde(default)]
    pub max_users: Option<u32>,
    #[serde(default)]
    pub max_services: Option<u32>,
    #[serde(default)]
    pub max_traffic_bytes: Option<u64>,
    #[serde(default)]
    pub max_concurrent_total: Option<u32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_duration_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}
