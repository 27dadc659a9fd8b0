//! Apply lifecycle bookkeeping.
//!
//! Each snapshot moves `NEW -> RENDERED -> APPLYING -> {APPLIED,
//! PARTIAL_FAILURE, FAILED}`. Results are append-only and, when a data
//! directory is configured, written to `apply_history.json`.

use crate::error::{FleetError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use vpn_registry::JsonStore;
use vpn_types::NodeId;
use vpn_xray::ConfigSnapshot;

pub const APPLY_HISTORY_FILE: &str = "apply_history.json";
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyState {
    New,
    Rendered,
    Applying,
    Applied,
    PartialFailure,
    Failed,
}

impl ApplyState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplyState::Applied | ApplyState::PartialFailure | ApplyState::Failed
        )
    }
}

impl std::fmt::Display for ApplyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ApplyState::New => "NEW",
            ApplyState::Rendered => "RENDERED",
            ApplyState::Applying => "APPLYING",
            ApplyState::Applied => "APPLIED",
            ApplyState::PartialFailure => "PARTIAL_FAILURE",
            ApplyState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Aggregate outcome of one apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    PartialFailure,
    Failed,
}

impl From<ApplyStatus> for ApplyState {
    fn from(status: ApplyStatus) -> Self {
        match status {
            ApplyStatus::Applied => ApplyState::Applied,
            ApplyStatus::PartialFailure => ApplyState::PartialFailure,
            ApplyStatus::Failed => ApplyState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub snapshot_id: u64,
    pub applied_at: DateTime<Utc>,
    pub status: ApplyStatus,
    pub healthy: bool,
    pub error: Option<String>,
    pub outcomes: BTreeMap<NodeId, NodeOutcome>,
}

impl ApplyResult {
    /// Aggregate per-node outcomes. An empty outcome set is a failure.
    pub fn aggregate(
        snapshot_id: u64,
        applied_at: DateTime<Utc>,
        outcomes: BTreeMap<NodeId, NodeOutcome>,
    ) -> Self {
        if outcomes.is_empty() {
            return Self {
                snapshot_id,
                applied_at,
                status: ApplyStatus::Failed,
                healthy: false,
                error: Some("snapshot has no target nodes".to_string()),
                outcomes,
            };
        }

        let succeeded = outcomes.values().filter(|o| o.success).count();
        let status = if succeeded == outcomes.len() {
            ApplyStatus::Applied
        } else if succeeded > 0 {
            ApplyStatus::PartialFailure
        } else {
            ApplyStatus::Failed
        };

        let failures: Vec<String> = outcomes
            .iter()
            .filter(|(_, o)| !o.success)
            .map(|(id, o)| {
                format!(
                    "node {} ({}): {}",
                    id,
                    o.node_name,
                    o.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();

        Self {
            snapshot_id,
            applied_at,
            status,
            healthy: status == ApplyStatus::Applied,
            error: (!failures.is_empty()).then(|| failures.join("; ")),
            outcomes,
        }
    }
}

/// What `status()` reports: a read of recorded results, never a live node check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetStatus {
    pub state: ApplyState,
    pub healthy: bool,
    pub last_snapshot_id: Option<u64>,
    pub last_result: Option<ApplyResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrackerDocument {
    last_snapshot_id: u64,
    results: VecDeque<ApplyResult>,
}

#[derive(Debug)]
struct TrackedSnapshot {
    snapshot: Arc<ConfigSnapshot>,
    state: ApplyState,
}

#[derive(Debug, Default)]
struct TrackerState {
    snapshots: VecDeque<TrackedSnapshot>,
    results: VecDeque<ApplyResult>,
    last_snapshot_id: u64,
}

#[derive(Debug)]
pub struct ApplyTracker {
    inner: Mutex<TrackerState>,
    history_limit: usize,
    store: Option<JsonStore<TrackerDocument>>,
}

impl ApplyTracker {
    pub fn in_memory(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(TrackerState::default()),
            history_limit: history_limit.max(1),
            store: None,
        }
    }

    /// Tracker persisted to `<data_dir>/apply_history.json`.
    pub fn open<P: AsRef<Path>>(data_dir: P, history_limit: usize) -> Result<Self> {
        let store: JsonStore<TrackerDocument> = JsonStore::new(data_dir.as_ref().join(APPLY_HISTORY_FILE));
        let document = store
            .load()
            .map_err(|e| FleetError::Storage(e.to_string()))?
            .unwrap_or_default();

        debug!(
            results = document.results.len(),
            last_snapshot_id = document.last_snapshot_id,
            "Loaded apply history"
        );

        Ok(Self {
            inner: Mutex::new(TrackerState {
                snapshots: VecDeque::new(),
                results: document.results,
                last_snapshot_id: document.last_snapshot_id,
            }),
            history_limit: history_limit.max(1),
            store: Some(store),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, TrackerState>> {
        self.inner
            .lock()
            .map_err(|_| FleetError::Internal("apply tracker lock poisoned".to_string()))
    }

    /// Write the durable part of the tracker. Called with the state lock held
    /// so saves land in the order the changes were made.
    fn save(&self, last_snapshot_id: u64, results: &VecDeque<ApplyResult>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let document = TrackerDocument {
            last_snapshot_id,
            results: results.clone(),
        };
        store
            .save(&document)
            .map_err(|e| FleetError::Storage(e.to_string()))
    }

    /// Highest snapshot id seen so far, including persisted history.
    pub fn last_snapshot_id(&self) -> u64 {
        self.lock().map(|state| state.last_snapshot_id).unwrap_or(0)
    }

    /// NEW -> RENDERED. The snapshot id is saved before the snapshot is
    /// handed out, so a restart never issues it again.
    pub fn record_rendered(&self, snapshot: ConfigSnapshot) -> Result<Arc<ConfigSnapshot>> {
        let snapshot = Arc::new(snapshot);
        let mut state = self.lock()?;

        let last_snapshot_id = state.last_snapshot_id.max(snapshot.id);
        self.save(last_snapshot_id, &state.results)?;
        state.last_snapshot_id = last_snapshot_id;
        state.snapshots.push_back(TrackedSnapshot {
            snapshot: Arc::clone(&snapshot),
            state: ApplyState::Rendered,
        });

        while state.snapshots.len() > self.history_limit {
            // Never evict the new snapshot or one whose apply is still running.
            let older = state.snapshots.len() - 1;
            match state
                .snapshots
                .iter()
                .take(older)
                .position(|t| t.state != ApplyState::Applying)
            {
                Some(index) => {
                    state.snapshots.remove(index);
                }
                None => break,
            }
        }

        Ok(snapshot)
    }

    /// RENDERED -> APPLYING. Anything else is an invalid transition.
    pub fn begin_apply(&self, snapshot_id: u64) -> Result<Arc<ConfigSnapshot>> {
        let mut state = self.lock()?;
        let tracked = state
            .snapshots
            .iter_mut()
            .find(|t| t.snapshot.id == snapshot_id)
            .ok_or_else(|| {
                FleetError::InvalidState(format!("snapshot {} has not been rendered", snapshot_id))
            })?;

        if tracked.state != ApplyState::Rendered {
            return Err(FleetError::InvalidState(format!(
                "snapshot {} is {}, expected RENDERED",
                snapshot_id, tracked.state
            )));
        }

        tracked.state = ApplyState::Applying;
        Ok(Arc::clone(&tracked.snapshot))
    }

    /// APPLYING -> terminal state, recording the result.
    pub fn finish_apply(&self, result: ApplyResult) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(tracked) = state
            .snapshots
            .iter_mut()
            .find(|t| t.snapshot.id == result.snapshot_id)
        {
            tracked.state = result.status.into();
        } else {
            warn!(snapshot_id = result.snapshot_id, "Finished apply for an evicted snapshot");
        }

        state.results.push_back(result);
        while state.results.len() > self.history_limit {
            state.results.pop_front();
        }

        self.save(state.last_snapshot_id, &state.results)
    }

    pub fn state_of(&self, snapshot_id: u64) -> Option<ApplyState> {
        let state = self.lock().ok()?;
        state
            .snapshots
            .iter()
            .find(|t| t.snapshot.id == snapshot_id)
            .map(|t| t.state)
    }

    pub fn snapshot(&self, snapshot_id: u64) -> Option<Arc<ConfigSnapshot>> {
        let state = self.lock().ok()?;
        state
            .snapshots
            .iter()
            .find(|t| t.snapshot.id == snapshot_id)
            .map(|t| Arc::clone(&t.snapshot))
    }

    /// Recorded results, oldest first.
    pub fn history(&self) -> Vec<ApplyResult> {
        self.lock()
            .map(|state| state.results.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn status(&self) -> Result<FleetStatus> {
        let state = self.lock()?;
        let last_result = state.results.back().cloned();
        let applying = state
            .snapshots
            .iter()
            .any(|t| t.state == ApplyState::Applying);

        let current = if applying {
            ApplyState::Applying
        } else if let Some(result) = &last_result {
            result.status.into()
        } else if !state.snapshots.is_empty() {
            ApplyState::Rendered
        } else {
            ApplyState::New
        };

        Ok(FleetStatus {
            state: current,
            healthy: last_result.as_ref().map_or(false, |r| r.healthy),
            last_snapshot_id: (state.last_snapshot_id > 0).then_some(state.last_snapshot_id),
            last_result,
        })
    }
}
