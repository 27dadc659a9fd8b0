//! Render, apply and rollout status. Admin only.

use crate::auth::Caller;
use crate::error::Result;
use crate::state::AppState;
use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use vpn_fleet::{ApplyResult, ApplyState, ApplyStatus, NodeOutcome};
use vpn_types::NodeId;
use vpn_xray::XrayConfig;

#[derive(Debug, Serialize)]
pub struct RenderOut {
    pub snapshot_id: u64,
    pub generated_at: DateTime<Utc>,
    pub content_hash: String,
    pub target_nodes: BTreeSet<NodeId>,
    pub config: XrayConfig,
}

#[derive(Debug, Serialize)]
pub struct ApplyOut {
    pub snapshot_id: u64,
    pub applied_at: DateTime<Utc>,
    pub status: ApplyStatus,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub nodes: BTreeMap<NodeId, NodeOutcome>,
}

impl From<ApplyResult> for ApplyOut {
    fn from(result: ApplyResult) -> Self {
        Self {
            snapshot_id: result.snapshot_id,
            applied_at: result.applied_at,
            status: result.status,
            healthy: result.healthy,
            error: result.error,
            nodes: result.outcomes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusOut {
    pub healthy: bool,
    pub state: ApplyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_snapshot_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_apply_status: Option<ApplyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_apply_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<DateTime<Utc>>,
}

pub async fn render(State(state): State<AppState>, caller: Caller) -> Result<Json<RenderOut>> {
    caller.require_admin()?;
    let snapshot = state.control.render().await?;
    Ok(Json(RenderOut {
        snapshot_id: snapshot.id,
        generated_at: snapshot.generated_at,
        content_hash: snapshot.content_hash.clone(),
        target_nodes: snapshot.target_nodes.clone(),
        config: snapshot.content.clone(),
    }))
}

/// Render a fresh snapshot and push it to its targets.
pub async fn apply(State(state): State<AppState>, caller: Caller) -> Result<Json<ApplyOut>> {
    caller.require_admin()?;
    let result = state.control.render_and_apply().await?;
    Ok(Json(result.into()))
}

pub async fn status(State(state): State<AppState>, caller: Caller) -> Result<Json<StatusOut>> {
    caller.require_admin()?;
    let status = state.control.status()?;
    let last = status.last_result;
    Ok(Json(StatusOut {
        healthy: status.healthy,
        state: status.state,
        last_snapshot_id: status.last_snapshot_id,
        last_apply_status: last.as_ref().map(|r| r.status),
        last_apply_error: last.as_ref().and_then(|r| r.error.clone()),
        last_applied_at: last.as_ref().map(|r| r.applied_at),
    }))
}

pub async fn history(State(state): State<AppState>, caller: Caller) -> Result<Json<Vec<ApplyOut>>> {
    caller.require_admin()?;
    Ok(Json(state.control.history().into_iter().map(ApplyOut::from).collect()))
}
