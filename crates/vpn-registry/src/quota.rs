//! Quota enforcement.
//!
//! Activation is a pure function of expiry and traffic usage; `enforce`
//! recomputes it for every service and never touches the usage counter.
//! Plan ceilings are checked here too, before any registry write.

use crate::error::{RegistryError, Result};
use crate::registry::{Registry, RegistryState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};
use vpn_types::{Plan, ResellerId, Service, ServiceId};

/// Whether the service may appear in a rendered configuration at `now`.
pub fn check(service: &Service, now: DateTime<Utc>) -> bool {
    service.is_active
        && service.expires_at.map_or(true, |expires_at| expires_at > now)
        && service
            .traffic_limit_bytes
            .map_or(true, |limit| service.traffic_used_bytes < limit)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnforcementReport {
    pub checked: usize,
    pub deactivated: Vec<ServiceId>,
    pub reactivated: Vec<ServiceId>,
}

impl EnforcementReport {
    pub fn changed(&self) -> bool {
        !self.deactivated.is_empty() || !self.reactivated.is_empty()
    }
}

pub(crate) fn enforce_services(
    services: &mut BTreeMap<ServiceId, Service>,
    now: DateTime<Utc>,
) -> EnforcementReport {
    let mut report = EnforcementReport {
        checked: services.len(),
        ..Default::default()
    };

    for service in services.values_mut() {
        let expected = service.should_be_active(now);
        if service.is_active == expected {
            continue;
        }

        service.is_active = expected;
        if expected {
            report.reactivated.push(service.id);
        } else {
            report.deactivated.push(service.id);
        }
    }

    report
}

/// Run `enforce` every `period` until the handle is aborted.
pub fn spawn_enforcer(registry: Arc<Registry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "Starting periodic quota enforcement");

        loop {
            ticker.tick().await;
            if let Err(e) = registry.enforce().await {
                error!(error = %e, "Periodic quota enforcement failed");
            }
        }
    })
}

/// The plan currently bounding the reseller, if any. An expired
/// subscription blocks new capacity outright.
fn current_plan<'a>(
    state: &'a RegistryState,
    reseller_id: ResellerId,
    now: DateTime<Utc>,
) -> Result<Option<&'a Plan>> {
    let reseller = state
        .resellers
        .get(&reseller_id)
        .ok_or_else(|| RegistryError::not_found("Reseller", reseller_id))?;

    let Some(subscription) = &reseller.subscription else {
        return Ok(None);
    };

    if !subscription.is_current(now) {
        return Err(RegistryError::QuotaExceeded(format!(
            "plan subscription of reseller {} expired at {}",
            reseller_id, subscription.ends_at
        )));
    }

    state
        .plans
        .get(&subscription.plan_id)
        .map(Some)
        .ok_or_else(|| RegistryError::not_found("Plan", subscription.plan_id))
}

pub(crate) fn ensure_user_capacity(
    state: &RegistryState,
    reseller_id: ResellerId,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(plan) = current_plan(state, reseller_id, now)? else {
        return Ok(());
    };

    if let Some(max_users) = plan.max_users {
        let users = state
            .users
            .values()
            .filter(|user| user.reseller_id == Some(reseller_id))
            .count();
        if users >= max_users as usize {
            return Err(RegistryError::QuotaExceeded(format!(
                "plan '{}' allows at most {} users",
                plan.name, max_users
            )));
        }
    }

    Ok(())
}

/// Check that `candidate` fits the reseller's plan. `replacing` names the
/// service being updated so its old row is not counted twice.
pub(crate) fn ensure_service_capacity(
    state: &RegistryState,
    reseller_id: ResellerId,
    candidate: &Service,
    replacing: Option<ServiceId>,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(plan) = current_plan(state, reseller_id, now)? else {
        return Ok(());
    };

    let others: Vec<&Service> = state
        .services
        .values()
        .filter(|s| s.reseller_id == Some(reseller_id) && Some(s.id) != replacing)
        .collect();

    if let (Some(max_services), None) = (plan.max_services, replacing) {
        if others.len() >= max_services as usize {
            return Err(RegistryError::QuotaExceeded(format!(
                "plan '{}' allows at most {} services",
                plan.name, max_services
            )));
        }
    }

    if let Some(max_traffic) = plan.max_traffic_bytes {
        let requested = candidate.traffic_limit_bytes.ok_or_else(|| {
            RegistryError::QuotaExceeded(format!(
                "plan '{}' caps traffic; an unlimited service is not allowed",
                plan.name
            ))
        })?;

        let committed = others
            .iter()
            .filter_map(|s| s.traffic_limit_bytes)
            .fold(0u64, u64::saturating_add);

        if committed.saturating_add(requested) > max_traffic {
            return Err(RegistryError::QuotaExceeded(format!(
                "plan '{}' allows {} bytes in total; {} already committed",
                plan.name, max_traffic, committed
            )));
        }
    }

    if let Some(max_concurrent) = plan.max_concurrent_total {
        let requested = candidate.concurrent_limit.ok_or_else(|| {
            RegistryError::QuotaExceeded(format!(
                "plan '{}' caps concurrency; a service without concurrent_limit is not allowed",
                plan.name
            ))
        })?;

        let committed: u64 = others
            .iter()
            .filter_map(|s| s.concurrent_limit)
            .map(u64::from)
            .sum();

        if committed + u64::from(requested) > u64::from(max_concurrent) {
            return Err(RegistryError::QuotaExceeded(format!(
                "plan '{}' allows {} concurrent sessions in total; {} already committed",
                plan.name, max_concurrent, committed
            )));
        }
    }

    Ok(())
}
