//! On-disk artifact layout.
//!
//! ```text
//! <workspace>/<state_dir>/runs/<run_id>/run.json
//! <workspace>/<state_dir>/runs/<run_id>/<stage>/<stage_id>/manifest.json
//!                                                         /payload.json
//!                                                         /data.parquet
//!                                                         /tables/<table_id>.parquet
//!                                                         /outputs/<name>.parquet
//! ```
//!
//! Every file is written to a temporary name and renamed into place. The
//! manifest is written last: an artifact directory without a manifest is
//! uncommitted work and is never reused.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::payload::StagePayload;
use crate::cancellation::CleanupCandidate;
use crate::core::{ArtifactManifest, StageType};
use crate::errors::{DatError, Result};
use crate::frame::{arrow, DataFrame};
use crate::ids::{sanitize_component, workspace_relative};

const MANIFEST_FILE: &str = "manifest.json";
const PAYLOAD_FILE: &str = "payload.json";
const DATA_FILE: &str = "data.parquet";

/// Sub-directory of a Parse artifact holding committed tables.
pub const TABLES_DIR: &str = "tables";
/// Sub-directory of a Parse artifact holding combined outputs.
pub const OUTPUTS_DIR: &str = "outputs";

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatError::io(parent, e))?;
    }
    Ok(())
}

/// Writes `bytes` to `path` through a temporary file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let tmp = temp_path(path);
    std::fs::write(&tmp, bytes).map_err(|e| DatError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| DatError::io(path, e))
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Reads a JSON file, `None` when it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DatError::io(path, e)),
    }
}

/// Writes a table as Parquet atomically; `false` when it has no columns.
pub(crate) fn write_parquet_atomic(df: &DataFrame, path: &Path) -> Result<bool> {
    ensure_parent(path)?;
    let tmp = temp_path(path);
    if !arrow::write_parquet(df, &tmp)? {
        return Ok(false);
    }
    std::fs::rename(&tmp, path).map_err(|e| DatError::io(path, e))?;
    Ok(true)
}

/// Artifact storage of one workspace.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    workspace: PathBuf,
    runs_dir: PathBuf,
}

impl ArtifactStore {
    /// Creates a store under `<workspace>/<state_dir>/runs`.
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>, state_dir: &Path) -> Self {
        let workspace = workspace.into();
        let runs_dir = workspace.join(state_dir).join("runs");
        Self { workspace, runs_dir }
    }

    /// Returns the workspace root.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Returns the directory holding every run.
    #[must_use]
    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Returns the directory of one run.
    #[must_use]
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(sanitize_component(run_id))
    }

    /// Returns the directory of one artifact.
    #[must_use]
    pub fn artifact_dir(&self, run_id: &str, stage: StageType, artifact_id: &str) -> PathBuf {
        self.run_dir(run_id).join(stage.as_str()).join(sanitize_component(artifact_id))
    }

    /// Converts a path under the workspace to its relative form.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::PathSafety`] for a path outside the workspace.
    pub fn relative(&self, path: &Path) -> Result<String> {
        workspace_relative(&self.workspace, path)
    }

    /// Reads a committed artifact's manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be read.
    pub fn read_manifest(&self, run_id: &str, stage: StageType, artifact_id: &str) -> Result<Option<ArtifactManifest>> {
        read_json(&self.artifact_dir(run_id, stage, artifact_id).join(MANIFEST_FILE))
    }

    /// Reads a committed artifact's payload.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Input`] if the artifact is not committed.
    pub fn read_payload(&self, run_id: &str, stage: StageType, artifact_id: &str) -> Result<StagePayload> {
        let dir = self.artifact_dir(run_id, stage, artifact_id);
        if !dir.join(MANIFEST_FILE).exists() {
            return Err(DatError::input(
                self.relative(&dir)?,
                "artifact has no manifest and was never committed",
            ));
        }
        read_json(&dir.join(PAYLOAD_FILE))?
            .ok_or_else(|| DatError::Internal(format!("artifact {artifact_id} of {stage} has no payload")))
    }

    /// Writes a table under an artifact directory and returns its relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the Parquet file cannot be written.
    pub fn write_table(&self, dir: &Path, sub: &str, name: &str, df: &DataFrame) -> Result<Option<String>> {
        let path = dir.join(sub).join(format!("{}.parquet", sanitize_component(name)));
        if write_parquet_atomic(df, &path)? {
            Ok(Some(self.relative(&path)?))
        } else {
            Ok(None)
        }
    }

    /// Reads a table written by [`ArtifactStore::write_table`].
    ///
    /// # Errors
    ///
    /// Returns an error if the path is unsafe or the file unreadable.
    pub fn read_table(&self, relative: &str) -> Result<DataFrame> {
        let path = crate::ids::resolve_in_workspace(&self.workspace, relative)?;
        arrow::read_parquet(&path)
    }

    /// Commits an artifact: tabular view, payload, then the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written.
    pub fn commit(&self, mut manifest: ArtifactManifest, payload: &StagePayload) -> Result<ArtifactManifest> {
        let dir = self.artifact_dir(&manifest.run_id, manifest.stage, &manifest.artifact_id);
        std::fs::create_dir_all(&dir).map_err(|e| DatError::io(&dir, e))?;

        if let Some(df) = payload.tabular() {
            let path = dir.join(DATA_FILE);
            if write_parquet_atomic(&df, &path)? {
                manifest.row_counts.insert("data".to_string(), df.row_count());
                manifest.files.insert(0, self.relative(&path)?);
            }
        }
        write_json_atomic(&dir.join(PAYLOAD_FILE), payload)?;
        write_json_atomic(&dir.join(MANIFEST_FILE), &manifest)?;
        debug!(
            run_id = %manifest.run_id,
            stage = %manifest.stage,
            artifact_id = %manifest.artifact_id,
            "Artifact committed"
        );
        Ok(manifest)
    }

    /// Lists every artifact directory of a run, committed or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the run directory cannot be read.
    pub fn candidates(&self, run_id: &str) -> Result<Vec<CleanupCandidate>> {
        let run_dir = self.run_dir(run_id);
        let mut found = Vec::new();
        for stage in StageType::ALL {
            let stage_dir = run_dir.join(stage.as_str());
            let entries = match std::fs::read_dir(&stage_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(DatError::io(&stage_dir, e)),
            };
            let mut dirs: Vec<PathBuf> = entries
                .filter_map(std::result::Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            dirs.sort();
            for path in dirs {
                let artifact_id = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                found.push(CleanupCandidate {
                    stage,
                    relative: self.relative(&path)?,
                    artifact_id,
                    path,
                });
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::payload::{SelectionPayload, TableSelectionPayload};
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), Path::new(".dat"));
        (dir, store)
    }

    #[test]
    fn test_commit_writes_manifest_last_with_relative_paths() {
        let (_dir, store) = store();
        let payload = StagePayload::Selection(SelectionPayload {
            profile: "p".to_string(),
            profile_id: "abc".to_string(),
            profile_version: 1,
            files: vec!["a.csv".to_string(), "b.csv".to_string()],
        });
        let manifest = ArtifactManifest::new("id01", StageType::Selection, "run-1", "hash");
        let committed = store.commit(manifest, &payload).unwrap();

        assert_eq!(committed.files, vec![".dat/runs/run-1/selection/id01/data.parquet"]);
        assert_eq!(committed.row_counts["data"], 2);

        let read = store.read_manifest("run-1", StageType::Selection, "id01").unwrap().unwrap();
        assert_eq!(read, committed);
        assert_eq!(store.read_payload("run-1", StageType::Selection, "id01").unwrap(), payload);
        assert!(store.read_manifest("run-1", StageType::Selection, "other").unwrap().is_none());
    }

    #[test]
    fn test_uncommitted_artifact_is_not_readable() {
        let (_dir, store) = store();
        let dir = store.artifact_dir("run-1", StageType::Parse, "p1");
        let df = DataFrame::from_rows(vec!["x".to_string()], vec![vec![json!(1)]]);
        let path = store.write_table(&dir, TABLES_DIR, "sites", &df).unwrap().unwrap();
        assert_eq!(path, ".dat/runs/run-1/parse/p1/tables/sites.parquet");
        assert_eq!(store.read_table(&path).unwrap(), df);

        let err = store.read_payload("run-1", StageType::Parse, "p1").unwrap_err();
        assert!(matches!(err, DatError::Input { .. }));
    }

    #[test]
    fn test_candidates_lists_artifact_dirs() {
        let (_dir, store) = store();
        let payload = StagePayload::TableSelection(TableSelectionPayload::default());
        for id in ["b2", "a1"] {
            let manifest = ArtifactManifest::new(id, StageType::TableSelection, "run-1", "h");
            store.commit(manifest, &payload).unwrap();
        }
        let found = store.candidates("run-1").unwrap();
        let ids: Vec<&str> = found.iter().map(|c| c.artifact_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "b2"]);
        assert_eq!(found[0].relative, ".dat/runs/run-1/table_selection/a1");
        assert!(store.candidates("missing-run").unwrap().is_empty());
    }
}
