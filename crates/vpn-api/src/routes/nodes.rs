//! Node management. Every route here is admin only, and node auth tokens
//! only ever leave the panel masked.

use crate::auth::Caller;
use crate::error::Result;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use vpn_types::{NewNode, NodeId, NodeView};

#[derive(Debug, Deserialize)]
pub struct ActiveFlag {
    pub is_active: bool,
}

pub async fn list(State(state): State<AppState>, caller: Caller) -> Result<Json<Vec<NodeView>>> {
    caller.require_admin()?;
    let nodes = state.registry().list_nodes().await;
    Ok(Json(nodes.iter().map(|node| node.view()).collect()))
}

pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    Json(new_node): Json<NewNode>,
) -> Result<(StatusCode, Json<NodeView>)> {
    caller.require_admin()?;
    let node = state.registry().create_node(new_node).await?;
    Ok((StatusCode::CREATED, Json(node.view())))
}

pub async fn set_active(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<NodeId>,
    Json(flag): Json<ActiveFlag>,
) -> Result<Json<NodeView>> {
    caller.require_admin()?;
    let node = state.registry().set_node_active(id, flag.is_active).await?;
    Ok(Json(node.view()))
}
