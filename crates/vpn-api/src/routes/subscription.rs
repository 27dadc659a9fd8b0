//! Client subscription fetch. Authenticated by the token in the path only.

use crate::error::{ApiError, Result};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::debug;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

fn plain(status: StatusCode, body: String) -> Response {
    (status, [(CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

pub async fn fetch(State(state): State<AppState>, Path(token): Path<String>) -> Result<Response> {
    let lookup = state
        .registry()
        .lookup_subscription(&token)
        .await
        .ok_or_else(|| ApiError::NotFound("Subscription token not found".to_string()))?;
    let service = &lookup.service;

    let refusal = if service.is_expired(Utc::now()) {
        Some("SERVICE_EXPIRED")
    } else if service.is_over_quota() {
        Some("SERVICE_TRAFFIC_EXCEEDED")
    } else if !service.is_active {
        Some("SERVICE_DISABLED")
    } else {
        None
    };

    if let Some(reason) = refusal {
        debug!(service_id = service.id, reason, "Refused subscription fetch");
        return Ok(plain(StatusCode::FORBIDDEN, reason.to_string()));
    }

    let body = state
        .links
        .subscription_payload(service, &lookup.token, &lookup.nodes)?;
    Ok(plain(StatusCode::OK, body))
}
