//! Common types shared across the fleet control-plane crates
//!
//! This crate holds the data model (services, nodes, plans, resellers,
//! tokens), the caller scope, and input validation so that the registry,
//! the synthesizer and the HTTP layer agree on one vocabulary.

pub mod error;
pub mod node;
pub mod plan;
pub mod protocol;
pub mod service;
pub mod user;
pub mod validation;

pub use error::*;
pub use node::*;
pub use plan::*;
pub use protocol::*;
pub use service::*;
pub use user::*;
pub use validation::*;

pub type UserId = u64;
pub type ResellerId = u64;
pub type PlanId = u64;
pub type ServiceId = u64;
pub type NodeId = u64;
