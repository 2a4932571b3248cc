//! Explicit, user-invoked removal of stage artifacts.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::core::StageType;

/// What a cleanup request covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum CleanupTarget {
    /// Every artifact of the run.
    All,
    /// Every artifact of one stage.
    Stage {
        /// The stage.
        stage: StageType,
    },
    /// One artifact by id.
    Artifact {
        /// The artifact (stage) id.
        artifact_id: String,
    },
}

impl CleanupTarget {
    /// Returns true if the target covers `candidate`.
    #[must_use]
    pub fn selects(&self, candidate: &CleanupCandidate) -> bool {
        match self {
            Self::All => true,
            Self::Stage { stage } => candidate.stage == *stage,
            Self::Artifact { artifact_id } => candidate.artifact_id == *artifact_id,
        }
    }
}

/// An artifact directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupCandidate {
    /// Producing stage.
    pub stage: StageType,
    /// Artifact id.
    pub artifact_id: String,
    /// Directory to remove.
    pub path: PathBuf,
    /// Workspace-relative form of `path`, used in reports.
    pub relative: String,
}

/// Outcome of a cleanup request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    /// True if nothing was deleted.
    pub dry_run: bool,
    /// Artifacts removed, or that would be removed on a dry run.
    pub removed: Vec<String>,
    /// Artifacts kept because a locked or completed stage references them.
    pub protected: Vec<String>,
    /// Artifacts whose removal failed, with the error.
    pub failed: Vec<(String, String)>,
}

/// Removes every selected candidate not in `protected` (artifact ids).
///
/// On a dry run nothing is touched and `removed` lists what would go.
#[must_use]
pub fn cleanup_artifacts(
    candidates: &[CleanupCandidate],
    targets: &[CleanupTarget],
    protected: &HashSet<String>,
    dry_run: bool,
) -> CleanupResult {
    let mut result = CleanupResult {
        dry_run,
        ..CleanupResult::default()
    };
    for candidate in candidates.iter().filter(|c| targets.iter().any(|t| t.selects(c))) {
        if protected.contains(&candidate.artifact_id) {
            result.protected.push(candidate.relative.clone());
            continue;
        }
        if dry_run {
            result.removed.push(candidate.relative.clone());
            continue;
        }
        match std::fs::remove_dir_all(&candidate.path) {
            Ok(()) => result.removed.push(candidate.relative.clone()),
            Err(e) => {
                warn!(artifact = %candidate.relative, error = %e, "Artifact removal failed");
                result.failed.push((candidate.relative.clone(), e.to_string()));
            }
        }
    }
    info!(
        dry_run,
        removed = result.removed.len(),
        protected = result.protected.len(),
        failed = result.failed.len(),
        "Cleanup finished"
    );
    result
}
