//! Xray configuration synthesis.
//!
//! A render enforces quotas, reads the registry once, and produces an
//! immutable [`ConfigSnapshot`] whose content hash is stable for unchanged
//! state.

pub mod document;
pub mod error;
pub mod synthesizer;

pub use document::XrayConfig;
pub use error::{RenderError, Result};
pub use synthesizer::{content_hash, target_nodes, ConfigSnapshot, Synthesizer, XraySettings};
