//! Input validation for registry writes

use crate::error::{CommonError, Result};
use regex::Regex;
use std::net::IpAddr;
use url::Url;

/// Display-name validation (service, plan, node and reseller names)
pub struct NameValidator {
    max_length: usize,
}

impl Default for NameValidator {
    fn default() -> Self {
        Self { max_length: 100 }
    }
}

impl NameValidator {
    pub fn validate(&self, field: &str, value: &str) -> Result<()> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(CommonError::validation(field, "must not be empty"));
        }

        if trimmed.chars().count() > self.max_length {
            return Err(CommonError::validation(
                field,
                format!("must be at most {} characters long", self.max_length),
            ));
        }

        if trimmed.chars().any(char::is_control) {
            return Err(CommonError::validation(field, "must not contain control characters"));
        }

        Ok(())
    }
}

/// Email validation
pub struct EmailValidator {
    pattern: Regex,
}

impl Default for EmailValidator {
    fn default() -> Self {
        Self {
            pattern: Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
                .expect("static email pattern"),
        }
    }
}

impl EmailValidator {
    pub fn validate(&self, email: &str) -> Result<()> {
        if email.len() > 254 {
            return Err(CommonError::validation("email", "address is too long"));
        }

        if !self.pattern.is_match(email) {
            return Err(CommonError::validation("email", "invalid address format"));
        }

        Ok(())
    }
}

/// A parsed `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Listen address used for hostname endpoints and endpoint-less services.
pub const WILDCARD_LISTEN: &str = "0.0.0.0";

impl Endpoint {
    /// IP literals are bound directly; hostnames are advertised only and the
    /// node listens on all interfaces.
    pub fn listen_address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => WILDCARD_LISTEN.to_string(),
        }
    }
}

/// The `(listen, port)` inbound a service lands in.
pub fn listen_slot(endpoint: Option<&str>, default_port: u16) -> Result<(String, u16)> {
    match endpoint {
        Some(endpoint) => {
            let parsed = EndpointValidator::parse(endpoint)?;
            Ok((parsed.listen_address(), parsed.port))
        }
        None => Ok((WILDCARD_LISTEN.to_string(), default_port)),
    }
}

/// A wildcard and a specific address cannot share one port.
pub fn listen_slots_conflict(a: &(String, u16), b: &(String, u16)) -> bool {
    a.1 == b.1 && a.0 != b.0 && (a.0 == WILDCARD_LISTEN || b.0 == WILDCARD_LISTEN)
}

pub struct EndpointValidator;

impl EndpointValidator {
    /// Parse `host:port`, accepting bracketed IPv6 hosts (`[::1]:443`)
    pub fn parse(endpoint: &str) -> Result<Endpoint> {
        let (host, port) = endpoint
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| CommonError::validation("endpoint", "expected host:port"))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        HostValidator::validate("endpoint", host)?;

        let port: u16 = port
            .parse()
            .map_err(|_| CommonError::validation("endpoint", format!("invalid port '{}'", port)))?;
        PortValidator::validate("endpoint", port)?;

        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

pub struct PortValidator;

impl PortValidator {
    pub fn validate(field: &str, port: u16) -> Result<()> {
        if port == 0 {
            return Err(CommonError::validation(field, "port cannot be 0"));
        }
        Ok(())
    }
}

/// Hostname or IP literal
pub struct HostValidator;

impl HostValidator {
    pub fn validate(field: &str, host: &str) -> Result<()> {
        if host.is_empty() {
            return Err(CommonError::validation(field, "host must not be empty"));
        }

        if host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        let valid_label = |label: &str| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        };

        if host.len() > 253 || !host.split('.').all(valid_label) {
            return Err(CommonError::validation(field, format!("invalid host '{}'", host)));
        }

        Ok(())
    }
}

/// Node control-API base URL
pub struct UrlValidator;

impl UrlValidator {
    pub fn validate(field: &str, raw: &str) -> Result<Url> {
        let url = Url::parse(raw)
            .map_err(|e| CommonError::validation(field, format!("invalid URL: {}", e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(CommonError::validation(field, "scheme must be http or https"));
        }

        if url.host_str().is_none() {
            return Err(CommonError::validation(field, "URL has no host"));
        }

        Ok(url)
    }
}
