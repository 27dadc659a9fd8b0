//! Operators, end users and resellers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PlanId, ResellerId, UserId};

/// Operator role carried by an authenticated dashboard caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Reseller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Reseller => "RESELLER",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant scope every registry read and write is evaluated under.
///
/// An admin sees the whole registry; a reseller only the rows carrying its
/// own `reseller_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Admin,
    Reseller(ResellerId),
}

impl Scope {
    pub fn reseller_id(&self) -> Option<ResellerId> {
        match self {
            Scope::Admin => None,
            Scope::Reseller(id) => Some(*id),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Scope::Admin)
    }

    /// Whether a row owned by `owner` is visible under this scope
    pub fn permits(&self, owner: Option<ResellerId>) -> bool {
        match self {
            Scope::Admin => true,
            Scope::Reseller(id) => owner == Some(*id),
        }
    }
}

/// End user owning services. Its role is implicitly END_USER.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub full_name: String,
    pub reseller_id: Option<ResellerId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub reseller_id: Option<ResellerId>,
}

/// A reseller's purchase of a plan for one billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSubscription {
    pub plan_id: PlanId,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl PlanSubscription {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.ends_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reseller {
    pub id: ResellerId,
    pub name: String,
    /// Operator login mapped onto this reseller
    pub auth_username: String,
    pub contact_email: Option<String>,
    pub wallet_balance: i64,
    pub subscription: Option<PlanSubscription>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewReseller {
    pub name: String,
    pub auth_username: String,
    #[serde(default)]
    pub contact_email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletTransactionKind {
    Credit,
    Debit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: u64,
    pub reseller_id: ResellerId,
    pub amount: i64,
    pub kind: WalletTransactionKind,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
