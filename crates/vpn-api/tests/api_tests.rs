//! HTTP surface tests driven through the router with `oneshot`.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::tempdir;
use tower::ServiceExt;
use vpn_api::config::{AuthConfig, OperatorSeed};
use vpn_api::{router, AppState, AuthService, PanelConfig};
use vpn_fleet::{ApplyRequest, NodeClient, PushError};
use vpn_types::Node;

/// Nodes whose name starts with "ok" accept every push.
struct StubClient;

#[async_trait]
impl NodeClient for StubClient {
    async fn push(&self, node: &Node, _request: &ApplyRequest) -> Result<(), PushError> {
        if node.name.starts_with("ok") {
            Ok(())
        } else {
            Err(PushError::Rejected {
                status: 500,
                body: "xray test failed".to_string(),
            })
        }
    }
}

fn config() -> PanelConfig {
    let mut config = PanelConfig::default();
    config.auth.jwt_secret = "test-secret".to_string();
    config.auth.reseller = Some(OperatorSeed {
        username: "acme".to_string(),
        password: "acme-pw".to_string(),
    });
    config.subscription.domain = "panel.example.com".to_string();
    config
}

async fn state_for(config: &PanelConfig) -> AppState {
    AppState::with_node_client(config, Arc::new(StubClient))
        .await
        .unwrap()
}

async fn app() -> Router {
    router(state_for(&config()).await)
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn login(app: &Router, username: &str, password: &str, role: &str) -> String {
    let (status, body) = call(
        app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({ "username": username, "password": password, "role_tab": role })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body["access_token"].as_str().unwrap().to_string()
}

async fn create_user(app: &Router, token: &str, email: &str) -> u64 {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/users",
        Some(token),
        Some(json!({ "email": email, "full_name": "End User" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["id"].as_u64().unwrap()
}

async fn create_service(app: &Router, token: &str, body: Value) -> (StatusCode, Value) {
    call(app, Method::POST, "/api/services", Some(token), Some(body)).await
}

async fn create_node(app: &Router, token: &str, name: &str, ip: &str) -> u64 {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/nodes",
        Some(token),
        Some(json!({
            "name": name,
            "location": "Amsterdam",
            "ip_address": ip,
            "api_base_url": format!("http://{}:9000", ip),
            "auth_token": "node-secret-token",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_ne!(body["auth_token"], "node-secret-token");
    body["id"].as_u64().unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let app = app().await;
    let (status, body) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_login_and_session() {
    let app = app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({ "username": "admin", "password": "admin", "role_tab": "RESELLER" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], "Invalid credentials or role");

    let (status, _) = call(
        &app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({ "username": "admin", "password": "wrong", "role_tab": "ADMIN" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = login(&app, "admin", "admin", "ADMIN").await;
    let (status, me) = call(&app, Method::GET, "/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me, json!({ "username": "admin", "role": "ADMIN" }));

    let (status, body) = call(&app, Method::GET, "/auth/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], "Not authenticated");

    let (status, _) = call(&app, Method::GET, "/auth/me", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_cookie_authenticates() {
    let app = app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "username": "acme", "password": "acme-pw", "role_tab": "RESELLER" }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(set_cookie.starts_with("access_token="));
    assert!(set_cookie.contains("HttpOnly"));
    let pair = set_cookie.split(';').next().unwrap().to_string();

    let request = Request::builder()
        .uri("/auth/me")
        .header(header::COOKIE, pair)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let me: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(me, json!({ "username": "acme", "role": "RESELLER" }));
}

#[tokio::test]
async fn test_unprovisioned_reseller_is_forbidden() {
    let full = config();
    let without_seed = PanelConfig {
        auth: AuthConfig {
            reseller: None,
            ..full.auth.clone()
        },
        ..full.clone()
    };

    let base = state_for(&without_seed).await;
    let auth = AuthService::new(&full.auth).unwrap();
    let token = auth.issue_token(&auth.operator("acme").unwrap()).unwrap();
    let state = AppState {
        auth: Arc::new(auth),
        ..base
    };
    let app = router(state);

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({ "username": "acme", "password": "acme-pw", "role_tab": "RESELLER" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["detail"], "Reseller not provisioned");

    let (status, _) = call(&app, Method::GET, "/api/services", Some(&token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_reseller_is_confined_to_its_scope() {
    let app = app().await;
    let admin = login(&app, "admin", "admin", "ADMIN").await;
    let reseller = login(&app, "acme", "acme-pw", "RESELLER").await;

    let direct_user = create_user(&app, &admin, "direct@example.com").await;
    let (status, direct) =
        create_service(&app, &admin, json!({ "name": "Direct", "user_id": direct_user })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(direct["reseller_id"].is_null());

    let own_user = create_user(&app, &reseller, "customer@example.com").await;
    let (status, own) =
        create_service(&app, &reseller, json!({ "name": "Resold", "user_id": own_user })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(own["reseller_id"].as_u64().is_some());
    assert_eq!(own["is_active"], true);

    let (_, listed) = call(&app, Method::GET, "/api/services", Some(&reseller), None).await;
    assert_eq!(listed["items"].as_array().unwrap().len(), 1);
    assert_eq!(listed["items"][0]["name"], "Resold");
    assert_eq!(listed["limit"], 50);

    let (_, all) = call(&app, Method::GET, "/api/services", Some(&admin), None).await;
    assert_eq!(all["items"].as_array().unwrap().len(), 2);

    let foreign = format!("/api/services/{}", direct["id"]);
    let (status, _) = call(&app, Method::GET, &foreign, Some(&reseller), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = create_service(
        &app,
        &reseller,
        json!({ "name": "Sneaky", "user_id": own_user, "reseller_id": 999 }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = create_service(&app, &reseller, json!({ "name": "Sneaky", "user_id": direct_user })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let assign = format!("/api/services/{}/nodes", own["id"]);
    let (status, _) = call(&app, Method::POST, &assign, Some(&reseller), Some(json!([]))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    for (method, uri) in [
        (Method::GET, "/api/nodes"),
        (Method::POST, "/xray/render"),
        (Method::POST, "/xray/apply"),
        (Method::GET, "/xray/status"),
        (Method::GET, "/api/resellers"),
    ] {
        let (status, body) = call(&app, method, uri, Some(&reseller), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{} {}", uri, body);
        assert_eq!(body["detail"], "Admin role required");
    }
}

#[tokio::test]
async fn test_validation_and_not_found_mapping() {
    let app = app().await;
    let admin = login(&app, "admin", "admin", "ADMIN").await;
    let user = create_user(&app, &admin, "owner@example.com").await;

    for uri in ["/api/services?limit=0", "/api/services?limit=101"] {
        let (status, _) = call(&app, Method::GET, uri, Some(&admin), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    let (status, body) =
        create_service(&app, &admin, json!({ "name": "Core", "user_id": user, "ip_limit": 0 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("ip_limit"));

    let (status, _) = create_service(
        &app,
        &admin,
        json!({ "name": "Core", "user_id": user, "endpoint": "no-port-here" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::GET, "/api/services/42", Some(&admin), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].is_string());

    let (status, _) = call(&app, Method::POST, "/api/services/42/token", Some(&admin), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::POST, "/api/users", Some(&admin), Some(json!({
        "email": "owner@example.com",
        "full_name": "Duplicate",
    })))
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_plan_purchase_and_ceilings() {
    let app = app().await;
    let admin = login(&app, "admin", "admin", "ADMIN").await;
    let reseller = login(&app, "acme", "acme-pw", "RESELLER").await;

    let (_, resellers) = call(&app, Method::GET, "/api/resellers", Some(&admin), None).await;
    let reseller_id = resellers[0]["id"].as_u64().unwrap();
    assert_eq!(resellers[0]["auth_username"], "acme");

    let (status, plan) = call(
        &app,
        Method::POST,
        "/api/plans",
        Some(&admin),
        Some(json!({ "name": "Starter", "price": 100, "duration_days": 30, "max_services": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let plan_id = plan["id"].as_u64().unwrap();

    let (status, _) = call(&app, Method::POST, "/api/plans", Some(&reseller), Some(json!({ "name": "Mine" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, plans) = call(&app, Method::GET, "/api/plans", Some(&reseller), None).await;
    assert_eq!(plans.as_array().unwrap().len(), 1);

    let subscribe = format!("/api/resellers/{}/subscribe?plan_id={}", reseller_id, plan_id);
    let (status, _) = call(&app, Method::POST, &subscribe, Some(&reseller), None).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let credit = format!("/api/resellers/{}/credit", reseller_id);
    let (status, _) = call(&app, Method::POST, &credit, Some(&reseller), Some(json!({ "amount": 150 }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, funded) = call(&app, Method::POST, &credit, Some(&admin), Some(json!({ "amount": 150 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(funded["wallet_balance"], 150);

    let (status, body) = call(&app, Method::POST, &subscribe, Some(&reseller), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_null());

    let user = create_user(&app, &reseller, "customer@example.com").await;
    let (status, _) = create_service(&app, &reseller, json!({ "name": "First", "user_id": user })).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = create_service(&app, &reseller, json!({ "name": "Second", "user_id": user })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["detail"].as_str().unwrap().contains("Quota exceeded"));

    let report = format!("/api/resellers/{}/report", reseller_id);
    let (status, report) = call(&app, Method::GET, &report, Some(&reseller), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["users"], 1);
    assert_eq!(report["services"], 1);
    assert_eq!(report["wallet_balance"], 50);
    assert_eq!(report["plan"]["name"], "Starter");

    let ledger = format!("/api/resellers/{}/transactions", reseller_id);
    let (_, ledger) = call(&app, Method::GET, &ledger, Some(&reseller), None).await;
    let kinds: Vec<&str> = ledger
        .as_array()
        .unwrap()
        .iter()
        .map(|tx| tx["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["CREDIT", "DEBIT"]);
}

#[tokio::test]
async fn test_subscription_fetch() {
    let app = app().await;
    let admin = login(&app, "admin", "admin", "ADMIN").await;
    let user = create_user(&app, &admin, "owner@example.com").await;

    let (_, service) = create_service(
        &app,
        &admin,
        json!({ "name": "Core", "user_id": user, "traffic_limit_bytes": 100 }),
    )
    .await;
    let service_id = service["id"].as_u64().unwrap();

    let (status, issued) = call(
        &app,
        Method::POST,
        &format!("/api/services/{}/token", service_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(issued["service_id"], service_id);
    let token = issued["token"].as_str().unwrap().to_string();

    let (_, again) = call(
        &app,
        Method::POST,
        &format!("/api/services/{}/token", service_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(again["token"], token.as_str());

    let (_, link) = call(
        &app,
        Method::GET,
        &format!("/api/services/{}/link", service_id),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(link["token"], token.as_str());
    assert_eq!(
        link["link"],
        format!("https://panel.example.com:443/sub/{}", token).as_str()
    );

    let sub = format!("/sub/{}", token);
    let (status, body) = call(&app, Method::GET, &sub, None, None).await;
    assert_eq!(status, StatusCode::OK);
    let payload = body.as_str().unwrap();
    assert!(payload.starts_with("vless://"));
    assert!(payload.contains("@panel.example.com:443?"));
    assert!(payload.contains("sni=panel.example.com"));
    assert!(payload.ends_with("#Core-default"));
    assert!(!payload.contains(&token));

    let node = create_node(&app, &admin, "ok-edge", "198.51.100.10").await;
    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/api/services/{}/nodes", service_id),
        Some(&admin),
        Some(json!([node])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, Method::GET, &sub, None, None).await;
    let payload = body.as_str().unwrap();
    assert_eq!(payload.lines().count(), 1);
    assert!(payload.contains("@198.51.100.10:443?"));
    assert!(payload.ends_with("#Core-Amsterdam"));

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/api/services/{}/usage", service_id),
        Some(&admin),
        Some(json!({ "bytes": 100 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Method::GET, &sub, None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "SERVICE_TRAFFIC_EXCEEDED");

    let (status, _) = call(&app, Method::GET, "/sub/unknown-token", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_expired_service_subscription_is_refused() {
    let app = app().await;
    let admin = login(&app, "admin", "admin", "ADMIN").await;
    let user = create_user(&app, &admin, "owner@example.com").await;

    let (status, service) = create_service(
        &app,
        &admin,
        json!({ "name": "Old", "user_id": user, "expires_at": "2020-01-01T00:00:00Z" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(service["is_active"], false);

    let (_, issued) = call(
        &app,
        Method::POST,
        &format!("/api/services/{}/token", service["id"]),
        Some(&admin),
        None,
    )
    .await;
    let sub = format!("/sub/{}", issued["token"].as_str().unwrap());

    let (status, body) = call(&app, Method::GET, &sub, None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "SERVICE_EXPIRED");
}

#[tokio::test]
async fn test_render_apply_and_status() {
    let app = app().await;
    let admin = login(&app, "admin", "admin", "ADMIN").await;

    let (status, initial) = call(&app, Method::GET, "/xray/status", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(initial, json!({ "healthy": false, "state": "NEW" }));

    let (status, rendered) = call(&app, Method::POST, "/xray/render", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rendered["snapshot_id"], 1);
    assert!(rendered["generated_at"].is_string());
    assert_eq!(rendered["config"]["outbounds"][0]["protocol"], "freedom");
    assert_eq!(rendered["content_hash"].as_str().unwrap().len(), 64);

    let (status, empty) = call(&app, Method::POST, "/xray/apply", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(empty["status"], "failed");
    assert_eq!(empty["healthy"], false);
    assert_eq!(empty["error"], "snapshot has no target nodes");

    let user = create_user(&app, &admin, "owner@example.com").await;
    create_service(&app, &admin, json!({ "name": "Core", "user_id": user })).await;
    let good = create_node(&app, &admin, "ok-edge", "198.51.100.10").await;
    let bad = create_node(&app, &admin, "broken-edge", "198.51.100.11").await;

    let (status, applied) = call(&app, Method::POST, "/xray/apply", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(applied["snapshot_id"], 3);
    assert_eq!(applied["status"], "partial_failure");
    assert_eq!(applied["healthy"], false);
    assert_eq!(applied["nodes"][good.to_string()]["success"], true);
    assert_eq!(applied["nodes"][bad.to_string()]["success"], false);
    let error = applied["error"].as_str().unwrap();
    assert!(error.contains("broken-edge"));
    assert!(error.contains("HTTP 500: xray test failed"));

    let (_, status_body) = call(&app, Method::GET, "/xray/status", Some(&admin), None).await;
    assert_eq!(status_body["healthy"], false);
    assert_eq!(status_body["state"], "PARTIAL_FAILURE");
    assert_eq!(status_body["last_snapshot_id"], 3);
    assert_eq!(status_body["last_apply_status"], "partial_failure");
    assert!(status_body["last_applied_at"].is_string());

    let (_, nodes) = call(&app, Method::GET, "/api/nodes", Some(&admin), None).await;
    let seen: Vec<bool> = nodes
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["last_seen_at"].is_string())
        .collect();
    assert_eq!(seen, vec![true, false]);

    let (_, history) = call(&app, Method::GET, "/xray/history", Some(&admin), None).await;
    assert_eq!(history.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    let mut config = config();
    config.storage.data_dir = Some(dir.path().to_path_buf());

    let app = router(state_for(&config).await);
    let admin = login(&app, "admin", "admin", "ADMIN").await;
    create_user(&app, &admin, "owner@example.com").await;
    call(&app, Method::POST, "/xray/apply", Some(&admin), None).await;

    let restarted = router(state_for(&config).await);
    let admin = login(&restarted, "admin", "admin", "ADMIN").await;

    let (_, users) = call(&restarted, Method::GET, "/api/users", Some(&admin), None).await;
    assert_eq!(users["items"][0]["email"], "owner@example.com");

    let (_, resellers) = call(&restarted, Method::GET, "/api/resellers", Some(&admin), None).await;
    assert_eq!(resellers.as_array().unwrap().len(), 1);

    let (_, status) = call(&restarted, Method::GET, "/xray/status", Some(&admin), None).await;
    assert_eq!(status["last_snapshot_id"], 1);
    assert_eq!(status["last_apply_status"], "failed");

    let (_, rendered) = call(&restarted, Method::POST, "/xray/render", Some(&admin), None).await;
    assert_eq!(rendered["snapshot_id"], 2);
}
