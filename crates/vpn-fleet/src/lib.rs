//! Fleet side of the control plane: pushing rendered snapshots to nodes and
//! tracking each snapshot through its apply lifecycle.

pub mod client;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod tracker;

pub use client::{ApplyRequest, HttpNodeClient, NodeClient, DEFAULT_APPLY_PATH, NODE_TOKEN_HEADER};
pub use control::ControlPlane;
pub use coordinator::{FleetCoordinator, FleetSettings, PushOptions};
pub use error::{FleetError, PushError, Result};
pub use tracker::{
    ApplyResult, ApplyState, ApplyStatus, ApplyTracker, FleetStatus, NodeOutcome,
    APPLY_HISTORY_FILE, DEFAULT_HISTORY_LIMIT,
};
