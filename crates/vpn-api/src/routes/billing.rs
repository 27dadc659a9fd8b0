use crate::auth::Caller;
use crate::error::Result;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use vpn_registry::ResellerReport;
use vpn_types::{NewPlan, NewReseller, Plan, PlanId, Reseller, ResellerId, WalletTransaction};

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub plan_id: PlanId,
}

#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn list_plans(State(state): State<AppState>, _caller: Caller) -> Json<Vec<Plan>> {
    Json(state.registry().list_plans().await)
}

pub async fn create_plan(
    State(state): State<AppState>,
    caller: Caller,
    Json(new_plan): Json<NewPlan>,
) -> Result<(StatusCode, Json<Plan>)> {
    caller.require_admin()?;
    let plan = state.registry().create_plan(new_plan).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn list_resellers(State(state): State<AppState>, caller: Caller) -> Result<Json<Vec<Reseller>>> {
    caller.require_admin()?;
    Ok(Json(state.registry().list_resellers().await))
}

pub async fn create_reseller(
    State(state): State<AppState>,
    caller: Caller,
    Json(new_reseller): Json<NewReseller>,
) -> Result<(StatusCode, Json<Reseller>)> {
    caller.require_admin()?;
    let reseller = state.registry().create_reseller(new_reseller).await?;
    Ok((StatusCode::CREATED, Json(reseller)))
}

pub async fn get_reseller(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResellerId>,
) -> Result<Json<Reseller>> {
    Ok(Json(state.registry().get_reseller(caller.scope, id).await?))
}

pub async fn credit(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResellerId>,
    Json(req): Json<CreditRequest>,
) -> Result<Json<Reseller>> {
    caller.require_admin()?;
    Ok(Json(state.registry().credit_wallet(id, req.amount, req.reason).await?))
}

pub async fn subscribe(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResellerId>,
    Query(query): Query<SubscribeQuery>,
) -> Result<StatusCode> {
    state.registry().subscribe(caller.scope, id, query.plan_id).await?;
    Ok(StatusCode::OK)
}

pub async fn report(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResellerId>,
) -> Result<Json<ResellerReport>> {
    Ok(Json(state.registry().reseller_report(caller.scope, id).await?))
}

pub async fn transactions(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResellerId>,
) -> Result<Json<Vec<WalletTransaction>>> {
    Ok(Json(state.registry().wallet_transactions(caller.scope, id).await?))
}
