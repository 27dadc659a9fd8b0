//! Operator authentication.
//!
//! Dashboard operators are seeded from configuration and kept in memory with
//! Argon2 hashes. Sessions are HS256 JWTs carried either as a bearer token
//! or in the `access_token` cookie.

use crate::config::AuthConfig;
use crate::error::{ApiError, Result};
use crate::state::AppState;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use vpn_types::{Role, Scope};

pub const ACCESS_COOKIE: &str = "access_token";

/// Public part of an operator account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorView {
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
struct Operator {
    role: Role,
    password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

pub struct AuthService {
    operators: HashMap<String, Operator>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let mut service = Self {
            operators: HashMap::new(),
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            ttl: Duration::minutes(config.token_ttl_minutes),
        };

        service.add_operator(&config.admin.username, &config.admin.password, Role::Admin)?;
        if let Some(reseller) = &config.reseller {
            service.add_operator(&reseller.username, &reseller.password, Role::Reseller)?;
        }
        Ok(service)
    }

    pub fn add_operator(&mut self, username: &str, password: &str, role: Role) -> Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| ApiError::Internal(format!("password hashing failed: {}", e)))?
            .to_string();

        self.operators
            .insert(username.to_string(), Operator { role, password_hash });
        info!(username, role = %role, "Seeded operator");
        Ok(())
    }

    /// Check a login attempt made from the `expected_role` tab. Hash
    /// verification runs on the blocking pool.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        expected_role: Role,
    ) -> Result<Option<OperatorView>> {
        let Some(operator) = self.operators.get(username) else {
            return Ok(None);
        };
        if operator.role != expected_role {
            return Ok(None);
        }

        let password_hash = operator.password_hash.clone();
        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || {
            PasswordHash::new(&password_hash).is_ok_and(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
        })
        .await
        .map_err(|e| ApiError::Internal(format!("password check failed: {}", e)))?;

        Ok(verified.then(|| OperatorView {
            username: username.to_string(),
            role: operator.role,
        }))
    }

    pub fn operator(&self, username: &str) -> Option<OperatorView> {
        self.operators.get(username).map(|operator| OperatorView {
            username: username.to_string(),
            role: operator.role,
        })
    }

    pub fn issue_token(&self, operator: &OperatorView) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: operator.username.clone(),
            role: operator.role,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ApiError::Internal(format!("token signing failed: {}", e)))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "Rejected session token");
                ApiError::Unauthorized("Invalid token".to_string())
            })
    }
}

/// An authenticated dashboard operator and the registry scope it acts in.
#[derive(Debug, Clone)]
pub struct Caller {
    pub operator: OperatorView,
    pub scope: Scope,
}

impl Caller {
    pub fn require_admin(&self) -> Result<()> {
        if self.scope.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Admin role required".to_string()))
        }
    }
}

fn presented_token(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    bearer.or_else(|| {
        CookieJar::from_headers(&parts.headers)
            .get(ACCESS_COOKIE)
            .map(|cookie| cookie.value().to_string())
    })
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = presented_token(parts)
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".to_string()))?;
        let claims = state.auth.verify_token(&token)?;

        let operator = state
            .auth
            .operator(&claims.sub)
            .filter(|operator| operator.role == claims.role)
            .ok_or_else(|| ApiError::Unauthorized("User not found or role mismatch".to_string()))?;

        let scope = match operator.role {
            Role::Admin => Scope::Admin,
            Role::Reseller => {
                let reseller = state
                    .registry()
                    .reseller_by_username(&operator.username)
                    .await
                    .ok_or_else(|| {
                        warn!(username = %operator.username, "Reseller operator has no registry reseller");
                        ApiError::Forbidden("Reseller not provisioned".to_string())
                    })?;
                Scope::Reseller(reseller.id)
            }
        };

        Ok(Caller { operator, scope })
    }
}
