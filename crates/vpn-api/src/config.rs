//! Panel configuration.
//!
//! Loaded from a TOML file when one is named (`--config` or
//! `VPN_PANEL_CONFIG`), otherwise from defaults. `VPN_PANEL_*` environment
//! variables are applied on top in both cases.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use vpn_fleet::{FleetSettings, DEFAULT_HISTORY_LIMIT};
use vpn_registry::SubscriptionSettings;
use vpn_xray::XraySettings;

pub const CONFIG_ENV: &str = "VPN_PANEL_CONFIG";

const DEFAULT_JWT_SECRET: &str = "change-me-in-production";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub subscription: SubscriptionSettings,
    pub xray: XraySettings,
    pub fleet: FleetSettings,
    pub quota: QuotaConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info,vpn_api=debug".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// 0 disables the periodic pass; renders still enforce.
    pub enforce_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enforce_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    pub snapshot_history: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            snapshot_history: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorSeed {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_minutes: i64,
    pub admin: OperatorSeed,
    pub reseller: Option<OperatorSeed>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            token_ttl_minutes: 60,
            admin: OperatorSeed {
                username: "admin".to_string(),
                password: "admin".to_string(),
            },
            reseller: None,
        }
    }
}

impl AuthConfig {
    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEFAULT_JWT_SECRET
    }
}

impl PanelConfig {
    /// Resolve the configuration from `path`, `VPN_PANEL_CONFIG` and the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `VPN_PANEL_*` overrides read through `lookup`, then validate.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("VPN_PANEL_BIND") {
            self.server.bind_address = bind;
        }
        if let Some(port) = lookup("VPN_PANEL_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Invalid {
                key: "VPN_PANEL_PORT".to_string(),
                message: format!("'{}' is not a port number", port),
            })?;
        }
        if let Some(secret) = lookup("VPN_PANEL_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(username) = lookup("VPN_PANEL_ADMIN_USERNAME") {
            self.auth.admin.username = username;
        }
        if let Some(password) = lookup("VPN_PANEL_ADMIN_PASSWORD") {
            self.auth.admin.password = password;
        }
        if let (Some(username), Some(password)) = (
            lookup("VPN_PANEL_RESELLER_USERNAME"),
            lookup("VPN_PANEL_RESELLER_PASSWORD"),
        ) {
            self.auth.reseller = Some(OperatorSeed { username, password });
        }
        if let Some(dir) = lookup("VPN_PANEL_DATA_DIR") {
            self.storage.data_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(domain) = lookup("VPN_PANEL_SUB_DOMAIN") {
            self.subscription.domain = domain;
        }

        // An unset server name follows the advertised subscription domain.
        if self.xray.tls_server_name.as_deref().map_or(true, str::is_empty) {
            self.xray.tls_server_name = Some(self.subscription.domain.clone());
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::Invalid {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.auth.jwt_secret.is_empty() {
            return Err(invalid("auth.jwt_secret", "must not be empty"));
        }
        if self.auth.token_ttl_minutes <= 0 {
            return Err(invalid("auth.token_ttl_minutes", "must be positive"));
        }
        if self.auth.admin.username.trim().is_empty() || self.auth.admin.password.is_empty() {
            return Err(invalid("auth.admin", "username and password are required"));
        }
        if self.subscription.domain.trim().is_empty() {
            return Err(invalid("subscription.domain", "must not be empty"));
        }
        if self.xray.inbound_port == 0 {
            return Err(invalid("xray.inbound_port", "must be between 1 and 65535"));
        }
        if self.storage.snapshot_history == 0 {
            return Err(invalid("storage.snapshot_history", "must be at least 1"));
        }
        Ok(())
    }
}
