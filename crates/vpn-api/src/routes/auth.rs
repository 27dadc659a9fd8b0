use crate::auth::{Caller, OperatorView, ACCESS_COOKIE};
use crate::error::{ApiError, Result};
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, Json};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vpn_types::Role;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub role_tab: Role,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub user: OperatorView,
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<TokenResponse>)> {
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::Validation("username and password are required".to_string()));
    }

    let operator = state
        .auth
        .authenticate(&req.username, &req.password, req.role_tab)
        .await?
        .ok_or_else(|| {
            warn!(username = %req.username, role = %req.role_tab, "Rejected login");
            ApiError::Unauthorized("Invalid credentials or role".to_string())
        })?;

    if operator.role == Role::Reseller
        && state.registry().reseller_by_username(&operator.username).await.is_none()
    {
        return Err(ApiError::Forbidden("Reseller not provisioned".to_string()));
    }

    let token = state.auth.issue_token(&operator)?;
    let cookie = Cookie::build((ACCESS_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);

    info!(username = %operator.username, role = %operator.role, "Operator logged in");
    Ok((
        jar.add(cookie),
        Json(TokenResponse {
            access_token: token,
            token_type: "bearer",
            user: operator,
        }),
    ))
}

pub async fn logout(jar: CookieJar) -> (CookieJar, StatusCode) {
    (jar.remove(Cookie::build(ACCESS_COOKIE).path("/")), StatusCode::NO_CONTENT)
}

pub async fn me(caller: Caller) -> Json<OperatorView> {
    Json(caller.operator)
}
