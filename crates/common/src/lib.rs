//! Shared types for the certgate workspace.
//!
//! Only identifiers live here so that the configuration model and the
//! listener engine agree on how configuration objects are addressed.

pub mod ids;

pub use ids::{ConfigRef, ConfigUid, ResourceVersion};
