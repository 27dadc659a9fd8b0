use crate::client::{ApplyRequest, NodeClient};
use crate::error::PushError;
use crate::tracker::{ApplyResult, NodeOutcome};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use vpn_registry::Registry;
use vpn_types::NodeId;
use vpn_xray::ConfigSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    pub push_timeout_secs: u64,
    pub max_concurrent_pushes: usize,
    pub apply_path: String,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            push_timeout_secs: 10,
            max_concurrent_pushes: 8,
            apply_path: crate::client::DEFAULT_APPLY_PATH.to_string(),
        }
    }
}

/// Limits for one fan-out.
#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Upper bound for a single node's push.
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self::from(&FleetSettings::default())
    }
}

impl From<&FleetSettings> for PushOptions {
    fn from(settings: &FleetSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.push_timeout_secs.max(1)),
            max_concurrent: settings.max_concurrent_pushes.max(1),
        }
    }
}

/// Delivers snapshots to the fleet. Nodes are independent: one node's
/// failure or timeout never holds back another, and there is no retry.
#[derive(Clone)]
pub struct FleetCoordinator {
    client: Arc<dyn NodeClient>,
    options: PushOptions,
}

impl FleetCoordinator {
    pub fn new(client: Arc<dyn NodeClient>, options: PushOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &PushOptions {
        &self.options
    }

    /// Push `snapshot` to each of its target nodes and aggregate the outcome.
    /// Always completes with a result; per-node failures are recorded in it.
    pub async fn apply(&self, registry: &Registry, snapshot: &ConfigSnapshot) -> ApplyResult {
        let started = Instant::now();
        let request = Arc::new(ApplyRequest::from(snapshot));
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent));
        let mut outcomes: BTreeMap<NodeId, NodeOutcome> = BTreeMap::new();
        let mut tasks = JoinSet::new();

        for &node_id in &snapshot.target_nodes {
            let node = match registry.get_node(node_id).await {
                Ok(node) if node.is_active => node,
                Ok(node) => {
                    outcomes.insert(node_id, failed(&node.name, &PushError::Inactive, Duration::ZERO));
                    continue;
                }
                Err(_) => {
                    outcomes.insert(node_id, failed("unknown", &PushError::Missing, Duration::ZERO));
                    continue;
                }
            };

            let client = Arc::clone(&self.client);
            let request = Arc::clone(&request);
            let permit = Arc::clone(&semaphore);
            let timeout = self.options.timeout;

            tasks.spawn(async move {
                let _permit = permit.acquire_owned().await;
                let start = Instant::now();

                let result = match tokio::time::timeout(timeout, client.push(&node, &request)).await {
                    Ok(result) => result,
                    Err(_) => Err(PushError::Timeout(timeout)),
                };

                (node, result, start.elapsed())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (node, result, latency) = match joined {
                Ok(done) => done,
                Err(join_error) => {
                    error!(error = %join_error, "Node push task failed to complete");
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    if let Err(e) = registry.touch_node(node.id, Utc::now()).await {
                        warn!(node_id = node.id, error = %e, "Could not record node last_seen_at");
                    }
                    info!(
                        node_id = node.id,
                        snapshot_id = snapshot.id,
                        latency_ms = latency.as_millis() as u64,
                        "Node accepted snapshot"
                    );
                    outcomes.insert(
                        node.id,
                        NodeOutcome {
                            node_name: node.name,
                            success: true,
                            error: None,
                            latency_ms: latency.as_millis() as u64,
                        },
                    );
                }
                Err(e) => {
                    warn!(
                        node_id = node.id,
                        snapshot_id = snapshot.id,
                        error = %e,
                        "Node rejected or missed snapshot"
                    );
                    outcomes.insert(node.id, failed(&node.name, &e, latency));
                }
            }
        }

        // A panicked task leaves its node without an outcome; count it as failed.
        for node_id in &snapshot.target_nodes {
            outcomes.entry(*node_id).or_insert_with(|| NodeOutcome {
                node_name: "unknown".to_string(),
                success: false,
                error: Some("push task aborted".to_string()),
                latency_ms: 0,
            });
        }

        let result = ApplyResult::aggregate(snapshot.id, Utc::now(), outcomes);
        info!(
            snapshot_id = snapshot.id,
            status = ?result.status,
            healthy = result.healthy,
            duration_ms = started.elapsed().as_millis() as u64,
            "Apply finished"
        );
        result
    }
}

fn failed(node_name: &str, error: &PushError, latency: Duration) -> NodeOutcome {
    NodeOutcome {
        node_name: node_name.to_string(),
        success: false,
        error: Some(error.to_string()),
        latency_ms: latency.as_millis() as u64,
    }
}
