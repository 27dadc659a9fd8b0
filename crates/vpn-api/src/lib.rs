//! HTTP control surface of the VPN fleet panel: operator auth, registry
//! management, config render/apply and client subscriptions.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use auth::{AuthService, Caller, Claims, OperatorView, ACCESS_COOKIE};
pub use config::{ConfigError, PanelConfig};
pub use error::{ApiError, Result};
pub use routes::{app, cors_layer, router};
pub use state::AppState;
