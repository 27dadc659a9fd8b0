use crate::auth::Caller;
use crate::error::{ApiError, Result};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use vpn_registry::{Page, Paginated};
use vpn_types::{NewService, NodeId, Service, ServiceId, ServiceUpdate};

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageQuery {
    pub fn page(&self) -> Result<Page> {
        Ok(Page::new(self.limit, self.offset)?)
    }
}

#[derive(Debug, Serialize)]
pub struct TokenOut {
    pub id: u64,
    pub token: String,
    pub service_id: ServiceId,
}

#[derive(Debug, Serialize)]
pub struct LinkOut {
    pub token: String,
    pub link: String,
}

#[derive(Debug, Deserialize)]
pub struct UsageReport {
    pub bytes: u64,
}

pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<Service>>> {
    let page = query.page()?;
    Ok(Json(state.registry().list_services(caller.scope, page).await))
}

pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    Json(new_service): Json<NewService>,
) -> Result<(StatusCode, Json<Service>)> {
    let service = state.registry().create_service(caller.scope, new_service).await?;
    Ok((StatusCode::CREATED, Json(service)))
}

pub async fn get_one(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ServiceId>,
) -> Result<Json<Service>> {
    Ok(Json(state.registry().get_service(caller.scope, id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ServiceId>,
    Json(update): Json<ServiceUpdate>,
) -> Result<Json<Service>> {
    Ok(Json(state.registry().update_service(caller.scope, id, update).await?))
}

pub async fn issue_token(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ServiceId>,
) -> Result<Json<TokenOut>> {
    let token = state.registry().ensure_token(caller.scope, id).await?;
    Ok(Json(TokenOut {
        id: token.id,
        token: token.token,
        service_id: token.service_id,
    }))
}

pub async fn link(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ServiceId>,
) -> Result<Json<LinkOut>> {
    let token = state.registry().ensure_token(caller.scope, id).await?;
    Ok(Json(LinkOut {
        link: state.links.build_link(&token.token),
        token: token.token,
    }))
}

/// Replace the service's node set. Admin only.
pub async fn assign_nodes(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ServiceId>,
    Json(node_ids): Json<Vec<NodeId>>,
) -> Result<StatusCode> {
    caller.require_admin()?;
    state.registry().assign_nodes(caller.scope, id, &node_ids).await?;
    Ok(StatusCode::OK)
}

/// Traffic accounting feed. Admin only; usage only ever grows.
pub async fn record_usage(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ServiceId>,
    Json(report): Json<UsageReport>,
) -> Result<Json<Service>> {
    caller.require_admin()?;
    if report.bytes == 0 {
        return Err(ApiError::Validation("bytes must be positive".to_string()));
    }
    let service = state.registry().record_usage(id, report.bytes).await?;
    info!(service_id = id, bytes = report.bytes, "Recorded traffic usage");
    Ok(Json(service))
}
