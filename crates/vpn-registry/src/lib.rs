//! Service registry for the fleet control plane: tenants, plans, services,
//! nodes, quota enforcement and subscription tokens.

pub mod error;
pub mod links;
pub mod page;
pub mod quota;
pub mod registry;
pub mod storage;
pub mod tokens;

pub use error::{RegistryError, Result};
pub use links::{SubscriptionLinkBuilder, SubscriptionSettings};
pub use page::{Page, Paginated};
pub use quota::{check, spawn_enforcer, EnforcementReport};
pub use registry::{
    EligibleService, Registry, RenderView, ResellerReport, SubscriptionLookup, DEFAULT_LISTEN_PORT,
    REGISTRY_FILE,
};
pub use storage::JsonStore;
pub use tokens::{client_id, generate_token, TokenIssuer};
