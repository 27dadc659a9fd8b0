use super::services::PageQuery;
use crate::auth::Caller;
use crate::error::Result;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use vpn_registry::Paginated;
use vpn_types::{NewUser, User, UserId};

pub async fn list(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<User>>> {
    let page = query.page()?;
    Ok(Json(state.registry().list_users(caller.scope, page).await))
}

pub async fn create(
    State(state): State<AppState>,
    caller: Caller,
    Json(new_user): Json<NewUser>,
) -> Result<(StatusCode, Json<User>)> {
    let user = state.registry().create_user(caller.scope, new_user).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_one(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<UserId>,
) -> Result<Json<User>> {
    Ok(Json(state.registry().get_user(caller.scope, id).await?))
}
