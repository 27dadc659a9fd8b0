use crate::error::{RegistryError, Result};
use crate::tokens::client_id;
use serde::{Deserialize, Serialize};
use url::Url;
use vpn_types::{EndpointValidator, Node, Service, SubscriptionToken};

/// Where subscription links point. Comes from static configuration only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    pub scheme: String,
    pub domain: String,
    pub port: u16,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            domain: "localhost".to_string(),
            port: 443,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionLinkBuilder {
    settings: SubscriptionSettings,
    inbound_port: u16,
}

impl SubscriptionLinkBuilder {
    pub fn new(settings: SubscriptionSettings, inbound_port: u16) -> Self {
        Self {
            settings,
            inbound_port,
        }
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    /// `scheme://domain:port/sub/<token>`; the token is percent-encoded.
    pub fn build_link(&self, token: &str) -> String {
        format!(
            "{}://{}:{}/sub/{}",
            self.settings.scheme,
            self.settings.domain,
            self.settings.port,
            urlencoding::encode(token)
        )
    }

    /// Plain-text subscription body: one client link per active assigned
    /// node, or a single link through the service endpoint when there is none.
    pub fn subscription_payload(
        &self,
        service: &Service,
        token: &SubscriptionToken,
        nodes: &[Node],
    ) -> Result<String> {
        let mut links = Vec::new();

        for node in nodes.iter().filter(|node| node.is_active) {
            let address = format!("{}:{}", node.ip_address, self.inbound_port);
            links.push(self.vless_link(service, token, &address, &node.location)?);
        }

        if links.is_empty() {
            let address = service
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("{}:{}", self.settings.domain, self.inbound_port));
            links.push(self.vless_link(service, token, &address, "default")?);
        }

        Ok(links.join("\n"))
    }

    fn vless_link(
        &self,
        service: &Service,
        token: &SubscriptionToken,
        address: &str,
        location: &str,
    ) -> Result<String> {
        let endpoint = EndpointValidator::parse(address)?;

        let mut url = Url::parse(&format!("vless://{}@{}", client_id(&token.token), endpoint))
            .map_err(|e| RegistryError::validation("endpoint", e.to_string()))?;

        url.query_pairs_mut()
            .append_pair("encryption", "none")
            .append_pair("type", "tcp")
            .append_pair("security", "tls")
            .append_pair("sni", &self.settings.domain);

        url.set_fragment(Some(&format!("{}-{}", service.name, location)));

        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use vpn_types::ServiceProtocol;

    fn builder() -> SubscriptionLinkBuilder {
        SubscriptionLinkBuilder::new(
            SubscriptionSettings {
                scheme: "https".to_string(),
                domain: "sub.example.com".to_string(),
                port: 8443,
            },
            443,
        )
    }

    fn service(endpoint: Option<&str>) -> Service {
        Service {
            id: 1,
            name: "Core".to_string(),
            user_id: 1,
            reseller_id: None,
            protocol: ServiceProtocol::XrayVless,
            endpoint: endpoint.map(str::to_string),
            traffic_limit_bytes: None,
            traffic_used_bytes: 0,
            expires_at: None,
            ip_limit: None,
            concurrent_limit: None,
            is_active: true,
            node_ids: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    fn token(value: &str) -> SubscriptionToken {
        SubscriptionToken {
            id: 1,
            token: value.to_string(),
            service_id: 1,
            created_at: Utc::now(),
        }
    }

    fn node(id: u64, ip: &str, location: &str, is_active: bool) -> Node {
        Node {
            id,
            name: format!("node-{}", id),
            location: location.to_string(),
            ip_address: ip.to_string(),
            api_base_url: format!("http://{}:9000", ip),
            auth_token: "secret".to_string(),
            is_active,
            last_seen_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_build_link_encodes_token() {
        assert_eq!(
            builder().build_link("a/b+c"),
            "https://sub.example.com:8443/sub/a%2Fb%2Bc"
        );
        assert_eq!(
            builder().build_link("plain_token-1"),
            "https://sub.example.com:8443/sub/plain_token-1"
        );
    }

    #[test]
    fn test_payload_has_one_line_per_active_node() {
        let nodes = vec![
            node(1, "203.0.113.7", "Frankfurt", true),
            node(2, "203.0.113.8", "Paris", false),
            node(3, "203.0.113.9", "Tokyo", true),
        ];
        let payload = builder()
            .subscription_payload(&service(None), &token("tok"), &nodes)
            .unwrap();

        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines.len(), 2);

        let expected_prefix = format!(
            "vless://{}@203.0.113.7:443?encryption=none&type=tcp&security=tls&sni=sub.example.com#Core-Frankfurt",
            client_id("tok")
        );
        assert_eq!(lines[0], expected_prefix);
        assert!(lines[1].ends_with("#Core-Tokyo"));
    }

    #[test]
    fn test_payload_falls_back_to_endpoint() {
        let payload = builder()
            .subscription_payload(&service(Some("edge.example.com:2053")), &token("tok"), &[])
            .unwrap();
        assert!(payload.contains("@edge.example.com:2053?"));
        assert!(payload.ends_with("#Core-default"));

        let payload = builder()
            .subscription_payload(&service(None), &token("tok"), &[])
            .unwrap();
        assert!(payload.contains("@sub.example.com:443?"));
    }
}
