use crate::coordinator::FleetCoordinator;
use crate::error::{FleetError, Result};
use crate::tracker::{ApplyResult, ApplyTracker, FleetStatus};
use std::sync::Arc;
use tracing::info;
use vpn_registry::Registry;
use vpn_xray::{ConfigSnapshot, Synthesizer, XraySettings};

/// Render, apply and status over one registry and fleet.
pub struct ControlPlane {
    registry: Arc<Registry>,
    synthesizer: Synthesizer,
    coordinator: FleetCoordinator,
    tracker: Arc<ApplyTracker>,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<Registry>,
        xray: XraySettings,
        coordinator: FleetCoordinator,
        tracker: ApplyTracker,
    ) -> Self {
        let synthesizer = Synthesizer::resume(xray, tracker.last_snapshot_id());
        Self {
            registry,
            synthesizer,
            coordinator,
            tracker: Arc::new(tracker),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn xray_settings(&self) -> &XraySettings {
        self.synthesizer.settings()
    }

    /// NEW -> RENDERED. Contacts no node.
    pub async fn render(&self) -> Result<Arc<ConfigSnapshot>> {
        let snapshot = self.synthesizer.render(&self.registry).await?;
        self.tracker.record_rendered(snapshot)
    }

    /// RENDERED -> APPLYING -> terminal. The fan-out runs on its own task, so
    /// a caller that stops waiting does not leave the snapshot stuck in
    /// APPLYING.
    pub async fn apply(&self, snapshot_id: u64) -> Result<ApplyResult> {
        let snapshot = self.tracker.begin_apply(snapshot_id)?;
        info!(snapshot_id, targets = snapshot.target_nodes.len(), "Applying snapshot");

        let registry = Arc::clone(&self.registry);
        let coordinator = self.coordinator.clone();
        let tracker = Arc::clone(&self.tracker);

        let task = tokio::spawn(async move {
            let result = coordinator.apply(&registry, &snapshot).await;
            tracker.finish_apply(result.clone())?;
            Ok::<_, FleetError>(result)
        });

        task.await
            .map_err(|e| FleetError::Internal(format!("apply task failed: {}", e)))?
    }

    /// Fresh render followed by an apply of that snapshot.
    pub async fn render_and_apply(&self) -> Result<ApplyResult> {
        let snapshot = self.render().await?;
        self.apply(snapshot.id).await
    }

    pub fn status(&self) -> Result<FleetStatus> {
        self.tracker.status()
    }

    pub fn history(&self) -> Vec<ApplyResult> {
        self.tracker.history()
    }

    pub fn snapshot(&self, snapshot_id: u64) -> Option<Arc<ConfigSnapshot>> {
        self.tracker.snapshot(snapshot_id)
    }
}
