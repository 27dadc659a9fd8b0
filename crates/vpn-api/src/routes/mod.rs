use crate::state::AppState;
use axum::{
    http::HeaderValue,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

mod auth;
mod billing;
mod nodes;
mod services;
mod subscription;
mod users;
mod xray;

/// The complete HTTP surface with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Operator session
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        // Services
        .route("/api/services", get(services::list).post(services::create))
        .route("/api/services/:id", get(services::get_one).put(services::update))
        .route("/api/services/:id/token", post(services::issue_token))
        .route("/api/services/:id/link", get(services::link))
        .route("/api/services/:id/nodes", post(services::assign_nodes))
        .route("/api/services/:id/usage", post(services::record_usage))
        // End users
        .route("/api/users", get(users::list).post(users::create))
        .route("/api/users/:id", get(users::get_one))
        // Fleet nodes
        .route("/api/nodes", get(nodes::list).post(nodes::create))
        .route("/api/nodes/:id/active", post(nodes::set_active))
        // Plans and resellers
        .route("/api/plans", get(billing::list_plans).post(billing::create_plan))
        .route("/api/resellers", get(billing::list_resellers).post(billing::create_reseller))
        .route("/api/resellers/:id", get(billing::get_reseller))
        .route("/api/resellers/:id/credit", post(billing::credit))
        .route("/api/resellers/:id/subscribe", post(billing::subscribe))
        .route("/api/resellers/:id/report", get(billing::report))
        .route("/api/resellers/:id/transactions", get(billing::transactions))
        // Config synthesis and rollout
        .route("/xray/render", post(xray::render))
        .route("/xray/apply", post(xray::apply))
        .route("/xray/status", get(xray::status))
        .route("/xray/history", get(xray::history))
        // Client subscriptions
        .route("/sub/:token", get(subscription::fetch))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// CORS for the dashboard origins; an empty list allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<_> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Router plus CORS, as served by the binary.
pub fn app(state: AppState, cors_origins: &[String]) -> Router {
    router(state).layer(ServiceBuilder::new().layer(cors_layer(cors_origins)))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready() -> Json<Value> {
    Json(json!({ "status": "ready" }))
}
