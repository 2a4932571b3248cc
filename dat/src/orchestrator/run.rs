//! Run state and run stores.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use super::storage::{read_json, write_json_atomic};
use crate::cancellation::CheckpointRegistry;
use crate::core::{StageStatus, StageType};
use crate::errors::{DatError, Result};
use crate::graph::StageGraphConfig;
use crate::ids::{sanitize_component, StageId};
use crate::utils::manifest_timestamp;

/// The record of one stage within a run.
///
/// `stage_id` is present exactly when the status is LOCKED or COMPLETED.
/// `artifact_id` survives unlock so the preserved artifact stays reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    /// Stage type.
    pub stage: StageType,
    /// Lifecycle status.
    pub status: StageStatus,
    /// Whether the stage may be skipped.
    pub is_optional: bool,
    /// Id of the current lock.
    pub stage_id: Option<String>,
    /// Full input digest of the current lock.
    pub input_hash: Option<String>,
    /// Last artifact produced; `None` after a skip.
    pub artifact_id: Option<String>,
    /// When the stage was last locked.
    pub locked_at: Option<String>,
    /// When the stage was completed.
    pub completed_at: Option<String>,
}

impl StageState {
    fn new(stage: StageType, is_optional: bool) -> Self {
        Self {
            stage,
            status: StageStatus::Unlocked,
            is_optional,
            stage_id: None,
            input_hash: None,
            artifact_id: None,
            locked_at: None,
            completed_at: None,
        }
    }

    /// Returns the artifact backing the current lock, if any.
    #[must_use]
    pub fn current_artifact(&self) -> Option<&str> {
        if self.status.is_locked_or_completed() {
            self.artifact_id.as_deref()
        } else {
            None
        }
    }
}

/// One end-to-end pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run id.
    pub run_id: String,
    /// Stage records, keyed by stage.
    pub stages: BTreeMap<StageType, StageState>,
    /// Run-wide context (the overrides of the locked Context stage).
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Checkpoint log.
    #[serde(default)]
    pub checkpoints: CheckpointRegistry,
    /// Creation time.
    pub created_at: String,
    /// Archival time; archived runs are read-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
}

impl Run {
    /// Creates a run with every stage of `graph` UNLOCKED.
    #[must_use]
    pub fn new(run_id: impl Into<String>, graph: &StageGraphConfig) -> Self {
        let stages = graph
            .order()
            .iter()
            .map(|stage| (*stage, StageState::new(*stage, graph.is_optional(*stage))))
            .collect();
        Self {
            run_id: run_id.into(),
            stages,
            context: Map::new(),
            checkpoints: CheckpointRegistry::new(),
            created_at: manifest_timestamp(),
            archived_at: None,
        }
    }

    /// Returns the status of `stage` (UNLOCKED for stages not in the run).
    #[must_use]
    pub fn status_of(&self, stage: StageType) -> StageStatus {
        self.stages.get(&stage).map_or(StageStatus::Unlocked, |s| s.status)
    }

    /// Returns the record of `stage`.
    #[must_use]
    pub fn stage(&self, stage: StageType) -> Option<&StageState> {
        self.stages.get(&stage)
    }

    /// Returns true if the run was archived.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    fn stage_mut(&mut self, stage: StageType) -> Result<&mut StageState> {
        self.stages
            .get_mut(&stage)
            .ok_or_else(|| DatError::gating(stage, "stage is not part of this run's graph"))
    }

    /// Records a lock backed by the artifact `id`.
    pub(crate) fn mark_locked(&mut self, stage: StageType, id: &StageId) -> Result<()> {
        let state = self.stage_mut(stage)?;
        state.status = StageStatus::Locked;
        state.stage_id = Some(id.id.clone());
        state.input_hash = Some(id.input_hash.clone());
        state.artifact_id = Some(id.id.clone());
        state.locked_at = Some(manifest_timestamp());
        state.completed_at = None;
        Ok(())
    }

    /// Records a skip: COMPLETED without an artifact.
    pub(crate) fn mark_skipped(&mut self, stage: StageType, id: &StageId) -> Result<()> {
        let state = self.stage_mut(stage)?;
        let now = manifest_timestamp();
        state.status = StageStatus::Completed;
        state.stage_id = Some(id.id.clone());
        state.input_hash = Some(id.input_hash.clone());
        state.artifact_id = None;
        state.locked_at = None;
        state.completed_at = Some(now);
        Ok(())
    }

    /// Records LOCKED -> COMPLETED.
    pub(crate) fn mark_completed(&mut self, stage: StageType) -> Result<()> {
        let state = self.stage_mut(stage)?;
        state.status = StageStatus::Completed;
        state.completed_at = Some(manifest_timestamp());
        Ok(())
    }

    /// Unlocks every stage in `stages` that holds a lock, keeping artifacts.
    pub(crate) fn mark_unlocked(&mut self, stages: &[StageType]) {
        for stage in stages {
            if let Some(state) = self.stages.get_mut(stage) {
                state.status = StageStatus::Unlocked;
                state.stage_id = None;
                state.input_hash = None;
                state.completed_at = None;
                if *stage == StageType::Context {
                    self.context.clear();
                }
            }
        }
    }
}

/// Durable storage of run state.
pub trait RunStore: Send + Sync + Debug {
    /// Loads a run, `None` if unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if stored state cannot be read.
    fn load(&self, run_id: &str) -> Result<Option<Run>>;

    /// Persists a run, replacing any previous state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn save(&self, run: &Run) -> Result<()>;

    /// Lists known run ids, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    fn list(&self) -> Result<Vec<String>>;
}

/// A process-local run store.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<String, Run>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for InMemoryRunStore {
    fn load(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    fn save(&self, run: &Run) -> Result<()> {
        self.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.runs.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// Stores each run as `<runs_dir>/<run_id>/run.json`.
#[derive(Debug, Clone)]
pub struct JsonRunStore {
    runs_dir: PathBuf,
}

impl JsonRunStore {
    /// Creates a store over `runs_dir`.
    #[must_use]
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    fn path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(sanitize_component(run_id)).join("run.json")
    }

    /// Returns the directory holding every run.
    #[must_use]
    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }
}

impl RunStore for JsonRunStore {
    fn load(&self, run_id: &str) -> Result<Option<Run>> {
        read_json(&self.path(run_id))
    }

    fn save(&self, run: &Run) -> Result<()> {
        write_json_atomic(&self.path(&run.run_id), run)
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.runs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DatError::io(&self.runs_dir, e)),
        };
        let mut ids: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.path().join("run.json").is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageType::*;

    fn id(text: &str) -> StageId {
        StageId {
            id: text.to_string(),
            input_hash: format!("{text}-hash"),
        }
    }

    #[test]
    fn test_new_run_has_every_stage_unlocked() {
        let run = Run::new("r1", &StageGraphConfig::default());
        assert_eq!(run.stages.len(), 8);
        assert!(run.stages.values().all(|s| s.status == StageStatus::Unlocked && s.stage_id.is_none()));
        assert!(run.stage(Context).unwrap().is_optional);
        assert!(!run.stage(Parse).unwrap().is_optional);
    }

    #[test]
    fn test_lock_unlock_keeps_artifact() {
        let mut run = Run::new("r1", &StageGraphConfig::default());
        run.mark_locked(Discovery, &id("d1")).unwrap();
        assert_eq!(run.status_of(Discovery), StageStatus::Locked);
        assert_eq!(run.stage(Discovery).unwrap().current_artifact(), Some("d1"));

        run.mark_unlocked(&[Discovery]);
        let state = run.stage(Discovery).unwrap();
        assert_eq!(state.status, StageStatus::Unlocked);
        assert!(state.stage_id.is_none());
        assert_eq!(state.artifact_id.as_deref(), Some("d1"));
        assert!(state.current_artifact().is_none());
    }

    #[test]
    fn test_skip_has_id_but_no_artifact() {
        let mut run = Run::new("r1", &StageGraphConfig::default());
        run.mark_skipped(Preview, &id("s1")).unwrap();
        let state = run.stage(Preview).unwrap();
        assert_eq!(state.status, StageStatus::Completed);
        assert_eq!(state.stage_id.as_deref(), Some("s1"));
        assert!(state.artifact_id.is_none());
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::new(dir.path().join("runs"));
        assert!(store.list().unwrap().is_empty());

        let mut run = Run::new("r1", &StageGraphConfig::default());
        run.mark_locked(Discovery, &id("d1")).unwrap();
        store.save(&run).unwrap();
        store.save(&Run::new("r0", &StageGraphConfig::default())).unwrap();

        assert_eq!(store.load("r1").unwrap(), Some(run));
        assert_eq!(store.list().unwrap(), vec!["r0", "r1"]);
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        let store = InMemoryRunStore::new();
        let run = Run::new("r1", &StageGraphConfig::default());
        store.save(&run).unwrap();
        assert_eq!(store.load("r1").unwrap(), Some(run));
        assert_eq!(store.list().unwrap(), vec!["r1"]);
    }
}
