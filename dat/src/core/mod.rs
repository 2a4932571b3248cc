//! Core domain model types for DAT.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage type and status enums
//! - Table probe status
//! - The persisted artifact manifest

mod artifact;
mod status;

pub use artifact::ArtifactManifest;
pub use status::{StageStatus, StageType, TableStatus};
