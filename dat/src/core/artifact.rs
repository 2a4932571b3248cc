//! Persisted stage artifact manifest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::StageType;

/// The JSON manifest written alongside every persisted stage artifact.
///
/// All paths are workspace-relative; no absolute filesystem path is ever
/// recorded here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// The artifact id (equal to the stage id that produced it).
    pub artifact_id: String,

    /// The stage that produced the artifact.
    pub stage: StageType,

    /// The run the artifact belongs to.
    pub run_id: String,

    /// Full SHA-256 of the canonical inputs, used for conflict detection.
    pub input_hash: String,

    /// Source files that contributed to the artifact.
    #[serde(default)]
    pub source_relative_paths: Vec<String>,

    /// Content hash of the profile in effect, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    /// Version of the profile in effect, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_version: Option<u32>,

    /// Row counts per persisted table or output.
    #[serde(default)]
    pub row_counts: BTreeMap<String, usize>,

    /// Data files belonging to the artifact, relative to the workspace.
    #[serde(default)]
    pub files: Vec<String>,

    /// Creation time, ISO-8601 UTC without sub-second precision.
    pub created_at: String,
}

impl ArtifactManifest {
    /// Creates a manifest stamped with the current time.
    #[must_use]
    pub fn new(
        artifact_id: impl Into<String>,
        stage: StageType,
        run_id: impl Into<String>,
        input_hash: impl Into<String>,
    ) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            stage,
            run_id: run_id.into(),
            input_hash: input_hash.into(),
            source_relative_paths: Vec::new(),
            profile_id: None,
            profile_version: None,
            row_counts: BTreeMap::new(),
            files: Vec::new(),
            created_at: crate::utils::manifest_timestamp(),
        }
    }

    /// Sets the source paths (sorted for stable output).
    #[must_use]
    pub fn with_sources(mut self, mut sources: Vec<String>) -> Self {
        sources.sort();
        sources.dedup();
        self.source_relative_paths = sources;
        self
    }

    /// Sets the profile identity.
    #[must_use]
    pub fn with_profile(mut self, profile_id: impl Into<String>, version: u32) -> Self {
        self.profile_id = Some(profile_id.into());
        self.profile_version = Some(version);
        self
    }

    /// Records a row count.
    #[must_use]
    pub fn with_row_count(mut self, name: impl Into<String>, rows: usize) -> Self {
        self.row_counts.insert(name.into(), rows);
        self
    }

    /// Records a data file.
    #[must_use]
    pub fn with_file(mut self, relative_path: impl Into<String>) -> Self {
        self.files.push(relative_path.into());
        self
    }
}
