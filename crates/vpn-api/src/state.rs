use crate::auth::AuthService;
use crate::config::PanelConfig;
use crate::error::{ApiError, Result};
use std::sync::Arc;
use tracing::info;
use vpn_fleet::{ApplyTracker, ControlPlane, FleetCoordinator, HttpNodeClient, NodeClient, PushOptions};
use vpn_registry::{Registry, SubscriptionLinkBuilder};
use vpn_types::NewReseller;

/// Shared handles for every request handler.
#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlPlane>,
    pub links: Arc<SubscriptionLinkBuilder>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    /// Wire the registry, fleet and auth from configuration. Pushes go over
    /// HTTP to each node's agent.
    pub async fn from_config(config: &PanelConfig) -> Result<Self> {
        let client: Arc<dyn NodeClient> = Arc::new(HttpNodeClient::new(config.fleet.apply_path.clone()));
        Self::with_node_client(config, client).await
    }

    pub async fn with_node_client(config: &PanelConfig, client: Arc<dyn NodeClient>) -> Result<Self> {
        let (registry, tracker) = match &config.storage.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ApiError::Internal(format!("cannot create data dir {}: {}", dir.display(), e))
                })?;
                info!(data_dir = %dir.display(), "Using persistent state");
                (
                    Registry::open(dir)?,
                    ApplyTracker::open(dir, config.storage.snapshot_history)?,
                )
            }
            None => {
                info!("No data dir configured; state is kept in memory only");
                (
                    Registry::in_memory(),
                    ApplyTracker::in_memory(config.storage.snapshot_history),
                )
            }
        };
        let registry = Arc::new(registry.with_default_listen_port(config.xray.inbound_port));

        if let Some(seed) = &config.auth.reseller {
            if registry.reseller_by_username(&seed.username).await.is_none() {
                let reseller = registry
                    .create_reseller(NewReseller {
                        name: "Seed Reseller".to_string(),
                        auth_username: seed.username.clone(),
                        contact_email: None,
                    })
                    .await?;
                info!(reseller_id = reseller.id, username = %seed.username, "Provisioned seed reseller");
            }
        }

        let coordinator = FleetCoordinator::new(client, PushOptions::from(&config.fleet));
        let control = ControlPlane::new(Arc::clone(&registry), config.xray.clone(), coordinator, tracker);
        let links = SubscriptionLinkBuilder::new(config.subscription.clone(), config.xray.inbound_port);

        Ok(Self {
            control: Arc::new(control),
            links: Arc::new(links),
            auth: Arc::new(AuthService::new(&config.auth)?),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.control.registry()
    }
}
