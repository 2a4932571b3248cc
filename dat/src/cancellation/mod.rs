//! Cooperative cancellation, checkpoints and artifact cleanup.
//!
//! This module provides:
//! - CancellationToken, polled only at checkpoint boundaries
//! - CheckpointRegistry, the append-only per-run checkpoint log
//! - cleanup_artifacts, dry-run-first removal of unprotected artifacts

mod checkpoint;
mod cleanup;
mod token;

pub use checkpoint::{Checkpoint, CheckpointRegistry, CheckpointType};
pub use cleanup::{cleanup_artifacts, CleanupCandidate, CleanupResult, CleanupTarget};
pub use token::CancellationToken;
