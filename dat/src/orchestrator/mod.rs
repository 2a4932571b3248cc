//! The stage orchestrator: lock, unlock, skip and complete stages of a run.
//!
//! A lock resolves the request against the run's locked upstream stages,
//! computes the stage id from the canonical inputs and either reuses the
//! committed artifact with that id or runs the stage and commits a new one.
//! Operations on one run are serialized; distinct runs proceed in parallel.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dat::config::DatConfig;
//! use dat::orchestrator::{ExportFormat, Orchestrator, StageRequest};
//! use dat::profile::ProfileStore;
//!
//! # async fn example() -> dat::errors::Result<()> {
//! let profiles = Arc::new(ProfileStore::open("/data/profiles")?);
//! let dat = Orchestrator::new("/data/workspace", profiles, DatConfig::default())?;
//!
//! let run = dat.create_run().await?;
//! dat.lock(&run.run_id, StageRequest::discovery("incoming")).await?;
//! dat.lock(&run.run_id, StageRequest::selection(Vec::<String>::new(), "wafer-sites")).await?;
//! dat.skip(&run.run_id, dat::core::StageType::Context).await?;
//! dat.lock(&run.run_id, StageRequest::TableAvailability { probe: Default::default() }).await?;
//! dat.lock(&run.run_id, StageRequest::tables(Vec::<String>::new())).await?;
//! dat.lock(&run.run_id, StageRequest::parse()).await?;
//! dat.complete(&run.run_id, dat::core::StageType::Parse).await?;
//! dat.lock(&run.run_id, StageRequest::export(&[ExportFormat::Csv], "exports")).await?;
//! # Ok(())
//! # }
//! ```

mod payload;
mod request;
mod run;
mod source;
mod stages;
mod storage;

#[cfg(test)]
mod integration_tests;

pub use payload::{
    ContextPayload, DiscoveryPayload, ExportPayload, ExportedFile, FileAvailability, ParsePayload, PersistedTable,
    PreviewPayload, PreviewTable, SelectionPayload, StagePayload, TableAvailabilityPayload, TableSelectionPayload,
};
pub use request::{ExportFormat, ParseOptions, ProbeOptions, StageRequest};
pub use run::{InMemoryRunStore, JsonRunStore, Run, RunStore, StageState};
pub use source::{FileMeta, FileSource, LocalFileSource};
pub use storage::{ArtifactStore, OUTPUTS_DIR, TABLES_DIR};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn, Instrument};

use crate::adapters::AdapterRegistry;
use crate::cancellation::{cleanup_artifacts, CancellationToken, CheckpointType, CleanupResult, CleanupTarget};
use crate::config::DatConfig;
use crate::core::{ArtifactManifest, StageStatus, StageType};
use crate::errors::{DatError, Result};
use crate::events::{DatEvent, EventKind, EventSink, NoOpEventSink};
use crate::frame::DataFrame;
use crate::graph::StageGraphConfig;
use crate::ids::{StageId, StageInputs};
use crate::observability::{stage_span, StageTimer};
use crate::profile::ProfileStore;
use crate::utils::manifest_timestamp;

/// Outcome of a lock or skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage.
    pub stage: StageType,
    /// Status after the operation.
    pub status: StageStatus,
    /// The stage id.
    pub stage_id: String,
    /// True if an existing artifact was reused instead of running the stage.
    pub reused: bool,
    /// Manifest of the backing artifact; `None` for a skip.
    pub manifest: Option<ArtifactManifest>,
}

/// Drives runs through the stage graph.
pub struct Orchestrator {
    workspace: PathBuf,
    config: DatConfig,
    graph: StageGraphConfig,
    adapters: Arc<AdapterRegistry>,
    profiles: Arc<ProfileStore>,
    source: Arc<dyn FileSource>,
    runs: Arc<dyn RunStore>,
    artifacts: ArtifactStore,
    events: Arc<dyn EventSink>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    active: DashMap<String, CancellationToken>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workspace", &self.workspace)
            .field("config", &self.config)
            .field("graph", &self.graph)
            .field("source", &self.source)
            .field("runs", &self.runs)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over `workspace` with the default stage graph,
    /// local files, JSON run state under the configured state directory and
    /// no event sink.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Config`] for an invalid configuration or a
    /// relative workspace path.
    pub fn new(workspace: impl Into<PathBuf>, profiles: Arc<ProfileStore>, config: DatConfig) -> Result<Self> {
        config.validate()?;
        let workspace = workspace.into();
        if !workspace.is_absolute() {
            return Err(DatError::Config(format!(
                "workspace must be an absolute path, got '{}'",
                workspace.display()
            )));
        }
        let artifacts = ArtifactStore::new(&workspace, &config.state_dir);
        let runs: Arc<dyn RunStore> = Arc::new(JsonRunStore::new(artifacts.runs_dir()));
        Ok(Self {
            source: Arc::new(LocalFileSource::new(&workspace)),
            adapters: Arc::new(AdapterRegistry::with_builtins()),
            graph: StageGraphConfig::default(),
            events: Arc::new(NoOpEventSink),
            locks: DashMap::new(),
            active: DashMap::new(),
            workspace,
            config,
            profiles,
            runs,
            artifacts,
        })
    }

    /// Replaces the stage graph.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Config`] if the graph is inconsistent.
    pub fn with_graph(mut self, graph: StageGraphConfig) -> Result<Self> {
        graph.validate()?;
        self.graph = graph;
        Ok(self)
    }

    /// Replaces the adapter registry.
    #[must_use]
    pub fn with_adapters(mut self, adapters: Arc<AdapterRegistry>) -> Self {
        self.adapters = adapters;
        self
    }

    /// Replaces the file source.
    #[must_use]
    pub fn with_file_source(mut self, source: Arc<dyn FileSource>) -> Self {
        self.source = source;
        self
    }

    /// Replaces the run store.
    #[must_use]
    pub fn with_run_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = runs;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the workspace root.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DatConfig {
        &self.config
    }

    /// Returns the stage graph.
    #[must_use]
    pub fn graph(&self) -> &StageGraphConfig {
        &self.graph
    }

    /// Returns the profile store.
    #[must_use]
    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    async fn guard(&self, run_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(run_id.to_string()).or_default().value());
        lock.lock_owned().await
    }

    fn load(&self, run_id: &str) -> Result<Run> {
        self.runs
            .load(run_id)?
            .ok_or_else(|| DatError::RunNotFound(run_id.to_string()))
    }

    fn ensure_mutable(&self, run: &Run, stage: StageType) -> Result<()> {
        if run.is_archived() {
            return Err(DatError::gating(stage, "run is archived"));
        }
        if !self.graph.contains(stage) || run.stage(stage).is_none() {
            return Err(DatError::gating(stage, "stage is not part of this run's graph"));
        }
        Ok(())
    }

    fn unmet(&self, run: &Run, stage: StageType) -> Option<StageType> {
        self.graph.unmet_dependency(stage, |s| run.status_of(s))
    }

    fn ensure_dependencies(&self, run: &Run, stage: StageType) -> Result<()> {
        match self.unmet(run, stage) {
            Some(dependency) => {
                let required = if self.graph.gating(stage).is_some_and(|r| r.require_completion) {
                    "COMPLETED"
                } else {
                    "LOCKED"
                };
                Err(DatError::unmet_dependency(stage, dependency, required))
            }
            None => Ok(()),
        }
    }

    pub(crate) async fn emit(&self, kind: EventKind, run_id: &str, stage: Option<StageType>, data: Value) {
        let event = DatEvent::new(kind, run_id, stage).with_data(data);
        self.events.emit(&event).await;
    }

    /// Creates a run with every stage UNLOCKED.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be stored.
    pub async fn create_run(&self) -> Result<Run> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run = Run::new(run_id, &self.graph);
        self.runs.save(&run)?;
        info!(run_id = %run.run_id, "Run created");
        Ok(run)
    }

    /// Returns the current state of a run.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::RunNotFound`] for an unknown run.
    pub fn status(&self, run_id: &str) -> Result<Run> {
        self.load(run_id)
    }

    /// Lists every known run id.
    ///
    /// # Errors
    ///
    /// Returns an error if the run store cannot be listed.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        self.runs.list()
    }

    /// Reports whether `stage` may be locked now, and the first unmet
    /// dependency if not.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::RunNotFound`] for an unknown run.
    pub fn can_lock(&self, run_id: &str, stage: StageType) -> Result<(bool, Option<StageType>)> {
        let run = self.load(run_id)?;
        if run.is_archived() || !self.graph.contains(stage) {
            return Ok((false, None));
        }
        let unmet = self.unmet(&run, stage);
        Ok((unmet.is_none(), unmet))
    }

    /// Locks a stage.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Gating`] for unmet dependencies or a stage locked
    /// with different inputs, [`DatError::DeterminismConflict`] if a stored
    /// artifact disagrees with the computed input hash, or the stage's own
    /// error.
    pub async fn lock(&self, run_id: &str, request: StageRequest) -> Result<StageResult> {
        self.lock_with_token(run_id, request, CancellationToken::new()).await
    }

    /// Locks a stage under a caller-held cancellation token.
    ///
    /// Cancellation is observed at checkpoint boundaries only. Work committed
    /// before the boundary stays on disk; the stage remains UNLOCKED.
    ///
    /// # Errors
    ///
    /// As [`Orchestrator::lock`], plus [`DatError::Cancellation`].
    pub async fn lock_with_token(
        &self,
        run_id: &str,
        request: StageRequest,
        token: CancellationToken,
    ) -> Result<StageResult> {
        let span = stage_span(run_id, request.stage(), "lock");
        self.lock_inner(run_id, request, token).instrument(span).await
    }

    async fn lock_inner(&self, run_id: &str, request: StageRequest, token: CancellationToken) -> Result<StageResult> {
        let stage = request.stage();
        let _guard = self.guard(run_id).await;
        let mut run = self.load(run_id)?;
        self.ensure_mutable(&run, stage)?;
        self.ensure_dependencies(&run, stage)?;

        let plan = self.plan(&run, request)?;
        let id = plan.inputs.stage_id(self.config.id_length);

        if let Some(result) = self.relock(&run, stage, &id)? {
            debug!(stage_id = %id.id, "Stage already locked with these inputs");
            return Ok(result);
        }

        if let Some(existing) = self.artifacts.read_manifest(run_id, stage, &id.id)? {
            if existing.input_hash != id.input_hash {
                return Err(DatError::DeterminismConflict {
                    stage,
                    stage_id: id.id.clone(),
                    existing_hash: existing.input_hash,
                    new_hash: id.input_hash.clone(),
                });
            }
            run.mark_locked(stage, &id)?;
            self.runs.save(&run)?;
            info!(stage_id = %id.id, "Stage locked, artifact reused");
            self.emit(EventKind::StageReused, run_id, Some(stage), json!({ "stage_id": id.id }))
                .await;
            return Ok(StageResult {
                stage,
                status: StageStatus::Locked,
                stage_id: id.id,
                reused: true,
                manifest: Some(existing),
            });
        }

        self.active.insert(run_id.to_string(), token.clone());
        let timer = StageTimer::start(stage);
        let executed = self.execute(&mut run, &id, plan.work, &token).await;
        self.active.remove(run_id);

        let (payload, manifest) = match executed {
            Ok(done) => done,
            Err(e @ DatError::Cancellation { .. }) => {
                self.runs.save(&run)?;
                warn!(stage_id = %id.id, reason = ?token.reason(), "Stage cancelled");
                self.emit(
                    EventKind::RunCancelled,
                    run_id,
                    Some(stage),
                    json!({ "stage_id": id.id, "reason": token.reason() }),
                )
                .await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let manifest = self.artifacts.commit(manifest, &payload)?;
        run.mark_locked(stage, &id)?;
        let checkpoint = run.checkpoints.mark_checkpoint(CheckpointType::StageComplete, id.id.clone());
        self.runs.save(&run)?;

        let elapsed_ms = timer.elapsed_ms();
        info!(stage_id = %id.id, elapsed_ms, "Stage locked");
        self.emit_checkpoint(run_id, stage, &checkpoint).await;
        self.emit(
            EventKind::StageLocked,
            run_id,
            Some(stage),
            json!({ "stage_id": id.id, "elapsed_ms": elapsed_ms }),
        )
        .await;
        Ok(StageResult {
            stage,
            status: StageStatus::Locked,
            stage_id: id.id,
            reused: false,
            manifest: Some(manifest),
        })
    }

    /// Handles a lock request for a stage that already holds a lock.
    fn relock(&self, run: &Run, stage: StageType, id: &StageId) -> Result<Option<StageResult>> {
        let Some(state) = run.stage(stage) else {
            return Ok(None);
        };
        if !state.status.is_locked_or_completed() {
            return Ok(None);
        }
        if state.stage_id.as_deref() != Some(id.id.as_str()) {
            return Err(DatError::gating(
                stage,
                format!("stage is {} with different inputs; unlock it first", state.status),
            ));
        }
        let manifest = match state.current_artifact() {
            Some(artifact) => self.artifacts.read_manifest(&run.run_id, stage, artifact)?,
            None => None,
        };
        Ok(Some(StageResult {
            stage,
            status: state.status,
            stage_id: id.id.clone(),
            reused: true,
            manifest,
        }))
    }

    /// Unlocks a stage and every stage in its cascade. Artifacts are kept.
    ///
    /// Returns the cascaded stages, in graph order.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Gating`] if the stage holds no lock or the run is
    /// archived.
    pub async fn unlock(&self, run_id: &str, stage: StageType) -> Result<Vec<StageType>> {
        let _guard = self.guard(run_id).await;
        let mut run = self.load(run_id)?;
        self.ensure_mutable(&run, stage)?;
        if !run.status_of(stage).is_locked_or_completed() {
            return Err(DatError::gating(stage, "stage is not locked"));
        }

        let targets = self.graph.cascade_targets(stage).to_vec();
        let mut affected = vec![stage];
        affected.extend(&targets);
        run.mark_unlocked(&affected);
        self.runs.save(&run)?;

        info!(run_id, stage = %stage, cascade = ?targets, "Stage unlocked");
        self.emit(EventKind::StageUnlocked, run_id, Some(stage), Value::Null).await;
        if !targets.is_empty() {
            self.emit(
                EventKind::StageCascadeUnlocked,
                run_id,
                Some(stage),
                json!({ "targets": targets }),
            )
            .await;
        }
        Ok(targets)
    }

    /// Skips an optional stage: it becomes COMPLETED without an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Gating`] if the stage is required, already holds a
    /// lock or its dependencies are unmet.
    pub async fn skip(&self, run_id: &str, stage: StageType) -> Result<StageResult> {
        let _guard = self.guard(run_id).await;
        let mut run = self.load(run_id)?;
        self.ensure_mutable(&run, stage)?;
        if !self.graph.is_optional(stage) {
            return Err(DatError::gating(stage, "only optional stages can be skipped"));
        }
        if run.status_of(stage) != StageStatus::Unlocked {
            return Err(DatError::gating(stage, format!("stage is already {}", run.status_of(stage))));
        }
        self.ensure_dependencies(&run, stage)?;

        let upstream: Vec<Value> = self
            .graph
            .gating(stage)
            .map(|rule| rule.required.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|dep| json!([dep, run.stage(*dep).and_then(|s| s.stage_id.clone())]))
            .collect();
        let id = StageId::compute(
            stage,
            &json!({ "skipped": true, "upstream": upstream }),
            self.config.id_length,
        );
        run.mark_skipped(stage, &id)?;
        self.runs.save(&run)?;

        info!(run_id, stage = %stage, stage_id = %id.id, "Stage skipped");
        self.emit(EventKind::StageSkipped, run_id, Some(stage), json!({ "stage_id": id.id }))
            .await;
        Ok(StageResult {
            stage,
            status: StageStatus::Completed,
            stage_id: id.id,
            reused: false,
            manifest: None,
        })
    }

    /// Marks a LOCKED stage COMPLETED.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Gating`] if the stage is not LOCKED.
    pub async fn complete(&self, run_id: &str, stage: StageType) -> Result<Run> {
        let _guard = self.guard(run_id).await;
        let mut run = self.load(run_id)?;
        self.ensure_mutable(&run, stage)?;
        if run.status_of(stage) != StageStatus::Locked {
            return Err(DatError::gating(
                stage,
                format!("only a LOCKED stage can be completed, stage is {}", run.status_of(stage)),
            ));
        }
        run.mark_completed(stage)?;
        self.runs.save(&run)?;

        info!(run_id, stage = %stage, "Stage completed");
        let stage_id = run.stage(stage).and_then(|s| s.stage_id.clone());
        self.emit(EventKind::StageCompleted, run_id, Some(stage), json!({ "stage_id": stage_id }))
            .await;
        Ok(run)
    }

    /// Returns the stage a user should act on next.
    ///
    /// COMPLETED stages and unlocked optional stages are passed over. A
    /// LOCKED stage is current when a later stage needs it COMPLETED.
    /// Otherwise the first UNLOCKED required stage that can be locked is
    /// current, and a run with nothing left to do reports its last stage.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::RunNotFound`] for an unknown run.
    pub fn current_stage(&self, run_id: &str) -> Result<StageType> {
        let run = self.load(run_id)?;
        Ok(self.current_stage_of(&run))
    }

    fn current_stage_of(&self, run: &Run) -> StageType {
        let order = self.graph.order();
        for stage in order {
            match run.status_of(*stage) {
                StageStatus::Completed => {}
                StageStatus::Locked => {
                    if self.graph.completion_required(*stage) {
                        return *stage;
                    }
                }
                StageStatus::Unlocked => {
                    if !self.graph.is_optional(*stage) && self.unmet(run, *stage).is_none() {
                        return *stage;
                    }
                }
            }
        }
        order.last().copied().unwrap_or(StageType::Export)
    }

    /// Archives a run. Archived runs reject every state change.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::RunNotFound`] for an unknown run.
    pub async fn archive_run(&self, run_id: &str) -> Result<Run> {
        let _guard = self.guard(run_id).await;
        let mut run = self.load(run_id)?;
        if run.is_archived() {
            return Ok(run);
        }
        run.archived_at = Some(manifest_timestamp());
        self.runs.save(&run)?;
        info!(run_id, "Run archived");
        self.emit(EventKind::RunArchived, run_id, None, Value::Null).await;
        Ok(run)
    }

    /// Requests cancellation of the stage running in `run_id`.
    ///
    /// Returns false if nothing is running.
    pub fn cancel(&self, run_id: &str, reason: impl Into<String>) -> bool {
        match self.active.get(run_id) {
            Some(token) => {
                token.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Returns the manifest of the stage's current artifact, or of its last
    /// artifact after an unlock.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::RunNotFound`] for an unknown run.
    pub fn artifact(&self, run_id: &str, stage: StageType) -> Result<Option<ArtifactManifest>> {
        let run = self.load(run_id)?;
        match run.stage(stage).and_then(|s| s.artifact_id.as_deref()) {
            Some(artifact) => self.artifacts.read_manifest(run_id, stage, artifact),
            None => Ok(None),
        }
    }

    /// Returns the payload behind a locked or completed stage.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::RunNotFound`] for an unknown run.
    pub fn payload(&self, run_id: &str, stage: StageType) -> Result<Option<StagePayload>> {
        let run = self.load(run_id)?;
        match run.stage(stage).and_then(StageState::current_artifact) {
            Some(artifact) => self.artifacts.read_payload(run_id, stage, artifact).map(Some),
            None => Ok(None),
        }
    }

    fn locked_payload<T>(&self, run_id: &str, stage: StageType) -> Result<T>
    where
        T: TryFrom<StagePayload, Error = DatError>,
    {
        self.payload(run_id, stage)?
            .ok_or_else(|| DatError::gating(stage, "stage is not locked"))
            .and_then(T::try_from)
    }

    /// Returns the probe results of the locked Table Availability stage.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Gating`] if the stage is not locked.
    pub fn table_availability(&self, run_id: &str) -> Result<TableAvailabilityPayload> {
        self.locked_payload(run_id, StageType::TableAvailability)
    }

    /// Returns the results of the locked Parse stage.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Gating`] if Parse is not locked.
    pub fn parse_results(&self, run_id: &str) -> Result<ParsePayload> {
        self.locked_payload(run_id, StageType::Parse)
    }

    fn read_persisted(&self, table: Option<&PersistedTable>, kind: &str, name: &str) -> Result<DataFrame> {
        let table = table.ok_or_else(|| DatError::input(name, format!("no such {kind} in the parse results")))?;
        match &table.path {
            Some(path) => self.artifacts.read_table(path),
            None => Ok(DataFrame::new(table.columns.clone())),
        }
    }

    /// Reads a table committed by the locked Parse stage.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Input`] for an unknown table.
    pub fn read_table(&self, run_id: &str, table_id: &str) -> Result<DataFrame> {
        let parse = self.parse_results(run_id)?;
        self.read_persisted(parse.table(table_id), "table", table_id)
    }

    /// Reads an output built by the locked Parse stage.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Input`] for an unknown output.
    pub fn read_output(&self, run_id: &str, name: &str) -> Result<DataFrame> {
        let parse = self.parse_results(run_id)?;
        self.read_persisted(parse.output(name), "output", name)
    }

    /// Removes artifacts of a run selected by `targets`.
    ///
    /// Artifacts backing a LOCKED or COMPLETED stage are never removed. A dry
    /// run reports what would go without touching anything.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::RunNotFound`] for an unknown run.
    pub async fn cleanup(&self, run_id: &str, targets: &[CleanupTarget], dry_run: bool) -> Result<CleanupResult> {
        let _guard = self.guard(run_id).await;
        let run = self.load(run_id)?;
        let protected: HashSet<String> = run
            .stages
            .values()
            .filter_map(StageState::current_artifact)
            .map(ToString::to_string)
            .collect();
        let candidates = self.artifacts.candidates(run_id)?;
        Ok(cleanup_artifacts(&candidates, targets, &protected, dry_run))
    }

    /// Resolves the canonical inputs a request would lock with, without
    /// running the stage. `inputs.stage_id(..)` gives the id.
    ///
    /// # Errors
    ///
    /// Returns the planning error a lock would return.
    pub fn resolve_inputs(&self, run_id: &str, request: StageRequest) -> Result<StageInputs> {
        let run = self.load(run_id)?;
        self.ensure_dependencies(&run, request.stage())?;
        Ok(self.plan(&run, request)?.inputs)
    }
}
