//! Per-stage work: resolving a request into canonical inputs, then running it.
//!
//! Planning is synchronous and side-effect free so the stage id is known
//! before any work starts. Execution produces the payload and manifest; the
//! caller commits them.

use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::payload::{
    ContextPayload, DiscoveryPayload, ExportPayload, ExportedFile, FileAvailability, ParsePayload,
    PersistedTable, PreviewPayload, PreviewTable, SelectionPayload, StagePayload, TableAvailabilityPayload,
    TableSelectionPayload,
};
use super::request::{ExportFormat, ParseOptions, StageRequest};
use super::run::{Run, StageState};
use super::storage::{write_atomic, write_json_atomic, write_parquet_atomic, ArtifactStore, OUTPUTS_DIR, TABLES_DIR};
use super::Orchestrator;
use crate::adapters::{chunk_stream, ProbeResult, ReadOptions};
use crate::cancellation::{CancellationToken, CheckpointType};
use crate::context::{ContextExtractor, ExtractionContext};
use crate::core::{ArtifactManifest, StageType, TableStatus};
use crate::errors::{DatError, Diagnostic, Result};
use crate::events::EventKind;
use crate::extract::{extract_table, ExtractedTable};
use crate::frame::{value, DataFrame};
use crate::ids::{resolve_in_workspace, workspace_relative, StageId, StageInputs};
use crate::output::{build_outputs, effective_outputs, render_file_name, FileNameVars, DEFAULT_FILE_NAME};
use crate::profile::{PopulationStrategy, Profile, PublishedProfile, TableDef};
use crate::transform::{RowFilter, TransformPipeline};
use crate::utils::GlobFilter;
use crate::validation::{validate, ValidationReport};

/// Inputs shared by Preview and Parse.
pub(super) struct Sources {
    selection: SelectionPayload,
    profile: Arc<Profile>,
    tables: Vec<String>,
    context: Option<ContextPayload>,
}

/// Export parameters.
pub(super) struct ExportWork {
    parse: ParsePayload,
    selection: SelectionPayload,
    profile: PublishedProfile,
    formats: Vec<ExportFormat>,
    output_path: String,
    text: Option<String>,
}

/// Resolved work of one stage.
pub(super) enum Work {
    Discovery {
        root: String,
        filter: GlobFilter,
        recursive: bool,
    },
    Selection(SelectionPayload),
    Context {
        selection: SelectionPayload,
        profile: Arc<Profile>,
        overrides: BTreeMap<String, Value>,
    },
    TableAvailability {
        selection: SelectionPayload,
        profile: Arc<Profile>,
        timeout: Duration,
    },
    TableSelection(TableSelectionPayload),
    Preview {
        sources: Sources,
        max_rows: usize,
    },
    Parse {
        sources: Sources,
        options: ParseOptions,
    },
    Export(Box<ExportWork>),
}

/// A planned lock: canonical inputs plus the work to run on a cache miss.
pub(super) struct Plan {
    pub(super) inputs: StageInputs,
    pub(super) work: Work,
}

/// A source file loaded for extraction.
struct LoadedFile {
    file: String,
    document: Value,
    context: ExtractionContext,
}

/// The result of extracting, validating and transforming one table.
#[derive(Debug)]
struct TableUnit {
    table_id: String,
    passed: Vec<ExtractedTable>,
    quarantine_id: Option<String>,
    quarantined: Vec<ExtractedTable>,
    report: ValidationReport,
    diagnostics: Vec<Diagnostic>,
}

fn join_error(e: tokio::task::JoinError) -> DatError {
    DatError::Internal(format!("worker task failed: {e}"))
}

fn relative_to_root<'a>(path: &'a str, root: &str) -> &'a str {
    if root.is_empty() {
        return path;
    }
    path.strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path)
}

fn availability_of(file: String, probe: ProbeResult) -> FileAvailability {
    let readable = !matches!(probe.status, TableStatus::Missing | TableStatus::Error);
    FileAvailability {
        file,
        status: probe.status,
        column_count: readable.then_some(probe.columns.len()),
        row_estimate: probe.row_estimate,
        error: probe.error,
        sheets: probe.tables,
    }
}

fn availability_failed(file: String, message: impl Into<String>) -> FileAvailability {
    FileAvailability {
        file,
        status: TableStatus::Error,
        column_count: None,
        row_estimate: None,
        error: Some(message.into()),
        sheets: Vec::new(),
    }
}

/// Extracts, validates and transforms one table across every loaded file.
///
/// Every file is extracted first; validation then runs once over the
/// assembled table so keys and aggregates span all files. The surviving rows
/// are split back per file before transforms run against each file's context.
/// A stable-columns mismatch in `error` mode, a `stop` validation failure or
/// a transform error fails the whole table; other extraction errors only
/// drop the offending file.
fn process_table(
    table: &TableDef,
    files: &[LoadedFile],
    global_filters: &[RowFilter],
    max_rows: Option<usize>,
) -> Result<TableUnit> {
    let pipeline = TransformPipeline::new(&table.transforms, global_filters)?;
    let mut diagnostics = Vec::new();
    let mut fragments: Vec<ExtractedTable> = Vec::new();
    let mut budget = max_rows;

    for loaded in files {
        let mut extracted = match extract_table(table, &loaded.document, &loaded.context) {
            Ok(extracted) => extracted,
            Err(e @ DatError::SchemaMismatch { .. }) => return Err(e),
            Err(e) => {
                diagnostics.push(Diagnostic::from_error(&e).with_table(&table.id).with_file(&loaded.file));
                continue;
            }
        };
        diagnostics.append(&mut extracted.diagnostics);

        if let Some(limit) = budget {
            let dropped = extracted.dataframe.truncate(limit);
            if dropped > 0 {
                diagnostics.push(
                    Diagnostic::new(
                        "DAT-GOVERNANCE",
                        format!("row limit reached, {dropped} rows dropped"),
                    )
                    .with_table(&table.id)
                    .with_file(&loaded.file),
                );
            }
            budget = Some(limit.saturating_sub(extracted.row_count()));
        }
        fragments.push(extracted);
    }

    let assembled = DataFrame::concat(
        &fragments
            .iter()
            .map(|f| f.dataframe.clone())
            .collect::<Vec<_>>(),
    );
    let outcome = validate(&table.id, &assembled, &table.validation)?;
    let mut unit = TableUnit {
        table_id: table.id.clone(),
        passed: Vec::new(),
        quarantine_id: table.validation.quarantine_table.clone(),
        quarantined: Vec::new(),
        report: outcome.report,
        diagnostics,
    };

    let mut offset = 0;
    for mut fragment in fragments {
        let rows = fragment.row_count();
        let (kept, rejected) = fragment.dataframe.partition(&outcome.kept[offset..offset + rows]);
        offset += rows;

        if rejected.row_count() > 0 {
            match &unit.quarantine_id {
                Some(quarantine_id) => {
                    let mut held = ExtractedTable::new(quarantine_id, &fragment.source, rejected);
                    held.context = fragment.context.clone();
                    unit.quarantined.push(held);
                }
                None => unit.diagnostics.push(
                    Diagnostic::new(
                        "DAT-VALIDATION",
                        format!("{} quarantined rows dropped, no quarantine table", rejected.row_count()),
                    )
                    .with_table(&table.id)
                    .with_file(&fragment.source),
                ),
            }
        }
        fragment.set_dataframe(pipeline.apply(kept)?);
        unit.passed.push(fragment);
    }
    Ok(unit)
}

fn write_export(df: &DataFrame, format: ExportFormat, path: &Path) -> Result<()> {
    match format {
        ExportFormat::Parquet => {
            write_parquet_atomic(df, path)?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer.write_record(df.columns())?;
            for row in df.rows() {
                writer.write_record(row.iter().map(value::to_text))?;
            }
            let bytes = writer.into_inner().map_err(|e| DatError::io(path, e.into_error()))?;
            write_atomic(path, &bytes)?;
        }
        ExportFormat::Json => {
            let bytes = serde_json::to_vec_pretty(&df.to_records())?;
            write_atomic(path, &bytes)?;
        }
    }
    Ok(())
}

/// Writes every Parse output in every requested format.
fn export_outputs(
    store: &ArtifactStore,
    work: &ExportWork,
    manifest: &mut ArtifactManifest,
) -> Result<ExportPayload> {
    let out_dir: PathBuf = resolve_in_workspace(store.workspace(), &work.output_path)?;
    let profile = &work.profile.profile;
    let definitions = effective_outputs(profile);
    let timestamp = chrono::Utc::now();
    let mut used = HashSet::new();
    let mut payload = ExportPayload {
        output_path: work.output_path.clone(),
        files: Vec::new(),
    };

    for persisted in &work.parse.outputs {
        let Some(relative) = &persisted.path else {
            debug!(output = %persisted.name, "Output has no columns, nothing to export");
            continue;
        };
        let df = store.read_table(relative)?;
        let template = definitions
            .iter()
            .find(|d| d.name == persisted.name)
            .and_then(|d| d.file_name.as_deref())
            .unwrap_or(DEFAULT_FILE_NAME);
        let stem = render_file_name(
            template,
            &FileNameVars {
                output: &persisted.name,
                profile: &profile.name,
                profile_id: &work.profile.profile_id,
                version: profile.version,
                timestamp,
                text: work.text.as_deref(),
            },
        )?;

        for format in &work.formats {
            let file_name = format!("{stem}.{}", format.extension());
            if !used.insert(file_name.clone()) {
                return Err(DatError::Output {
                    output: persisted.name.clone(),
                    message: format!("file name '{file_name}' is already used by another output"),
                });
            }
            let path = out_dir.join(&file_name);
            write_export(&df, *format, &path)?;
            let relative = store.relative(&path)?;
            manifest.files.push(relative.clone());
            payload.files.push(ExportedFile {
                output: persisted.name.clone(),
                format: *format,
                path: relative,
                rows: df.row_count(),
            });
        }
        manifest.row_counts.insert(persisted.name.clone(), df.row_count());
    }

    write_json_atomic(&out_dir.join("manifest.json"), manifest)?;
    Ok(payload)
}

impl Work {
    fn stage(&self) -> StageType {
        match self {
            Self::Discovery { .. } => StageType::Discovery,
            Self::Selection(_) => StageType::Selection,
            Self::Context { .. } => StageType::Context,
            Self::TableAvailability { .. } => StageType::TableAvailability,
            Self::TableSelection(_) => StageType::TableSelection,
            Self::Preview { .. } => StageType::Preview,
            Self::Parse { .. } => StageType::Parse,
            Self::Export(_) => StageType::Export,
        }
    }
}

impl Orchestrator {
    /// Reads the payload of the artifact behind a locked upstream stage.
    fn upstream<T>(&self, run: &Run, stage: StageType, needed_by: StageType) -> Result<(String, T)>
    where
        T: TryFrom<StagePayload, Error = DatError>,
    {
        let artifact = run
            .stage(stage)
            .and_then(StageState::current_artifact)
            .ok_or_else(|| DatError::unmet_dependency(needed_by, stage, "LOCKED"))?;
        let payload = self.artifacts.read_payload(&run.run_id, stage, artifact)?;
        Ok((artifact.to_string(), T::try_from(payload)?))
    }

    /// Returns the exact profile version bound at Selection.
    fn bound_profile(&self, selection: &SelectionPayload) -> Result<PublishedProfile> {
        let published = self
            .profiles
            .get_version(&selection.profile, selection.profile_version)?;
        if published.profile_id != selection.profile_id {
            return Err(DatError::ProfileNotFound(format!(
                "{} v{} with id {}",
                selection.profile, selection.profile_version, selection.profile_id
            )));
        }
        Ok(published)
    }

    fn sources(&self, run: &Run, stage: StageType) -> Result<(String, Option<String>, Sources)> {
        let (table_selection_id, tables): (String, TableSelectionPayload) =
            self.upstream(run, StageType::TableSelection, stage)?;
        let (_, selection): (String, SelectionPayload) = self.upstream(run, StageType::Selection, stage)?;
        let published = self.bound_profile(&selection)?;

        let context_id = run
            .stage(StageType::Context)
            .and_then(StageState::current_artifact)
            .map(ToString::to_string);
        let context = match &context_id {
            Some(id) => Some(ContextPayload::try_from(self.artifacts.read_payload(
                &run.run_id,
                StageType::Context,
                id,
            )?)?),
            None => None,
        };
        let sources = Sources {
            selection,
            profile: published.profile,
            tables: tables.tables,
            context,
        };
        Ok((table_selection_id, context_id, sources))
    }

    fn select_files(&self, discovery: &DiscoveryPayload, files: &[String], profile: &Profile) -> Result<Vec<String>> {
        let mut selected: Vec<String> = if files.is_empty() {
            let filter = profile.datasource.filter()?;
            let mut candidates: Vec<_> = discovery
                .files
                .iter()
                .filter(|f| filter.matches(&f.relative_path) && profile.datasource.allows_extension(&f.relative_path))
                .collect();
            match profile.population {
                PopulationStrategy::All => {}
                PopulationStrategy::FirstN { n } => candidates.truncate(n),
                PopulationStrategy::LatestN { n } => {
                    candidates.sort_by(|a, b| {
                        b.modified
                            .cmp(&a.modified)
                            .then_with(|| a.relative_path.cmp(&b.relative_path))
                    });
                    candidates.truncate(n);
                }
            }
            candidates.into_iter().map(|f| f.relative_path.clone()).collect()
        } else {
            let known: HashSet<&str> = discovery.files.iter().map(|f| f.relative_path.as_str()).collect();
            files
                .iter()
                .map(|file| {
                    let relative = workspace_relative(&self.workspace, Path::new(file))?;
                    if known.contains(relative.as_str()) {
                        Ok(relative)
                    } else {
                        Err(DatError::input(relative, "file was not discovered"))
                    }
                })
                .collect::<Result<_>>()?
        };
        selected.sort();
        selected.dedup();

        if selected.is_empty() {
            return Err(DatError::gating(StageType::Selection, "no files selected"));
        }
        if let Some(max) = profile.governance.max_files {
            if selected.len() > max {
                return Err(DatError::gating(
                    StageType::Selection,
                    format!(
                        "{} files selected, profile '{}' allows at most {max}",
                        selected.len(),
                        profile.name
                    ),
                ));
            }
        }
        Ok(selected)
    }

    /// Resolves a request against the run into canonical inputs and work.
    pub(super) fn plan(&self, run: &Run, request: StageRequest) -> Result<Plan> {
        let stage = request.stage();
        match request {
            StageRequest::Discovery {
                root,
                include,
                exclude,
                recursive,
            } => {
                let root = workspace_relative(&self.workspace, Path::new(&root))?;
                let filter = GlobFilter::new(&include, &exclude)?;
                Ok(Plan {
                    inputs: StageInputs::Discovery {
                        root: root.clone(),
                        include,
                        exclude,
                        recursive,
                    },
                    work: Work::Discovery {
                        root,
                        filter,
                        recursive,
                    },
                })
            }
            StageRequest::Selection { files, profile } => {
                let (discovery_id, discovery): (String, DiscoveryPayload) =
                    self.upstream(run, StageType::Discovery, stage)?;
                let published = self.profiles.get(&profile)?;
                let files = self.select_files(&discovery, &files, &published.profile)?;
                Ok(Plan {
                    inputs: StageInputs::Selection {
                        discovery_id,
                        files: files.clone(),
                        profile_id: published.profile_id.clone(),
                    },
                    work: Work::Selection(SelectionPayload {
                        profile: published.profile.name.clone(),
                        profile_id: published.profile_id,
                        profile_version: published.profile.version,
                        files,
                    }),
                })
            }
            StageRequest::Context { overrides } => {
                let (selection_id, selection): (String, SelectionPayload) =
                    self.upstream(run, StageType::Selection, stage)?;
                let profile = self.bound_profile(&selection)?.profile;
                ContextExtractor::new(&profile.name, &profile.context)?.check_overrides(&overrides)?;
                Ok(Plan {
                    inputs: StageInputs::Context {
                        selection_id,
                        overrides: overrides.clone(),
                    },
                    work: Work::Context {
                        selection,
                        profile,
                        overrides,
                    },
                })
            }
            StageRequest::TableAvailability { probe } => {
                let (selection_id, selection): (String, SelectionPayload) =
                    self.upstream(run, StageType::Selection, stage)?;
                let profile = self.bound_profile(&selection)?.profile;
                let timeout_ms = probe.timeout_ms.unwrap_or(self.config.probe_timeout_ms);
                Ok(Plan {
                    inputs: StageInputs::TableAvailability {
                        selection_id,
                        profile_id: selection.profile_id.clone(),
                        probe: serde_json::json!({ "timeout_ms": timeout_ms }),
                    },
                    work: Work::TableAvailability {
                        selection,
                        profile,
                        timeout: Duration::from_millis(timeout_ms),
                    },
                })
            }
            StageRequest::TableSelection { tables } => {
                let (table_availability_id, availability): (String, TableAvailabilityPayload) =
                    self.upstream(run, StageType::TableAvailability, stage)?;
                if let Some(unknown) = tables.iter().find(|t| !availability.tables.contains(t)) {
                    return Err(DatError::gating(stage, format!("table '{unknown}' is not available")));
                }
                let selected: Vec<String> = availability
                    .tables
                    .iter()
                    .filter(|t| tables.is_empty() || tables.contains(t))
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    return Err(DatError::gating(stage, "no tables available to select"));
                }
                Ok(Plan {
                    inputs: StageInputs::TableSelection {
                        table_availability_id,
                        tables: selected.clone(),
                    },
                    work: Work::TableSelection(TableSelectionPayload { tables: selected }),
                })
            }
            StageRequest::Preview { max_rows } => {
                let (table_selection_id, _, sources) = self.sources(run, stage)?;
                Ok(Plan {
                    inputs: StageInputs::Preview {
                        table_selection_id,
                        options: serde_json::json!({ "max_rows": max_rows }),
                    },
                    work: Work::Preview { sources, max_rows },
                })
            }
            StageRequest::Parse { options } => {
                let (table_selection_id, context_id, sources) = self.sources(run, stage)?;
                Ok(Plan {
                    inputs: StageInputs::Parse {
                        table_selection_id,
                        profile_id: sources.selection.profile_id.clone(),
                        context_id,
                        options: serde_json::to_value(options)?,
                    },
                    work: Work::Parse { sources, options },
                })
            }
            StageRequest::Export {
                formats,
                output_path,
                text,
            } => {
                if formats.is_empty() {
                    return Err(DatError::gating(stage, "no export formats requested"));
                }
                let output_path = workspace_relative(&self.workspace, Path::new(&output_path))?;
                let (parse_id, parse): (String, ParsePayload) = self.upstream(run, StageType::Parse, stage)?;
                let (_, selection): (String, SelectionPayload) = self.upstream(run, StageType::Selection, stage)?;
                let profile = self.bound_profile(&selection)?;
                Ok(Plan {
                    inputs: StageInputs::Export {
                        parse_id,
                        formats: formats.iter().map(|f| f.extension().to_string()).collect(),
                        output_path: output_path.clone(),
                    },
                    work: Work::Export(Box::new(ExportWork {
                        parse,
                        selection,
                        profile,
                        formats,
                        output_path,
                        text,
                    })),
                })
            }
        }
    }

    /// Runs planned work and returns the uncommitted payload and manifest.
    pub(super) async fn execute(
        &self,
        run: &mut Run,
        id: &StageId,
        work: Work,
        token: &CancellationToken,
    ) -> Result<(StagePayload, ArtifactManifest)> {
        let stage = work.stage();
        token.check(stage)?;
        let manifest = ArtifactManifest::new(&id.id, stage, &run.run_id, &id.input_hash);

        match work {
            Work::Discovery {
                root,
                filter,
                recursive,
            } => {
                let source = Arc::clone(&self.source);
                let list_root = root.clone();
                let listed = tokio::task::spawn_blocking(move || source.list(&list_root, recursive))
                    .await
                    .map_err(join_error)??;
                let files: Vec<_> = listed
                    .into_iter()
                    .filter(|f| filter.matches(relative_to_root(&f.relative_path, &root)))
                    .collect();
                info!(run_id = %run.run_id, root = %root, files = files.len(), "Files discovered");
                let manifest = manifest
                    .with_sources(files.iter().map(|f| f.relative_path.clone()).collect())
                    .with_row_count("files", files.len());
                Ok((StagePayload::Discovery(DiscoveryPayload { root, files }), manifest))
            }
            Work::Selection(selection) => {
                let manifest = manifest
                    .with_sources(selection.files.clone())
                    .with_profile(&selection.profile_id, selection.profile_version)
                    .with_row_count("files", selection.files.len());
                Ok((StagePayload::Selection(selection), manifest))
            }
            Work::Context {
                selection,
                profile,
                overrides,
            } => {
                let payload = self.resolve_context(&selection, &profile, overrides).await?;
                run.context = payload.overrides.clone().into_iter().collect::<Map<_, _>>();
                let manifest = manifest
                    .with_sources(selection.files.clone())
                    .with_profile(&selection.profile_id, selection.profile_version)
                    .with_row_count("files", payload.files.len());
                Ok((StagePayload::Context(payload), manifest))
            }
            Work::TableAvailability {
                selection,
                profile,
                timeout,
            } => {
                let files: Vec<FileAvailability> = stream::iter(selection.files.clone())
                    .map(|file| self.probe_file(file, timeout))
                    .buffered(self.config.worker_pool_size)
                    .collect()
                    .await;
                let usable = files.iter().filter(|f| f.status.is_usable()).count();
                let tables = if usable > 0 {
                    profile.tables.iter().map(|t| t.id.clone()).collect()
                } else {
                    Vec::new()
                };
                info!(run_id = %run.run_id, files = files.len(), usable, "Files probed");
                let manifest = manifest
                    .with_sources(selection.files.clone())
                    .with_profile(&selection.profile_id, selection.profile_version)
                    .with_row_count("files", files.len())
                    .with_row_count("usable", usable);
                Ok((
                    StagePayload::TableAvailability(TableAvailabilityPayload { files, tables }),
                    manifest,
                ))
            }
            Work::TableSelection(selection) => {
                let manifest = manifest.with_row_count("tables", selection.tables.len());
                Ok((StagePayload::TableSelection(selection), manifest))
            }
            Work::Preview { sources, max_rows } => {
                let payload = self.preview(&sources, max_rows).await?;
                let manifest = manifest
                    .with_sources(sources.selection.files.clone())
                    .with_profile(&sources.selection.profile_id, sources.selection.profile_version)
                    .with_row_count("samples", payload.tables.len());
                Ok((StagePayload::Preview(payload), manifest))
            }
            Work::Parse { sources, options } => self.parse(run, id, &sources, options, manifest, token).await,
            Work::Export(work) => {
                let store = self.artifacts.clone();
                let manifest = manifest
                    .with_sources(work.selection.files.clone())
                    .with_profile(&work.profile.profile_id, work.profile.profile.version);
                let (payload, manifest) = tokio::task::spawn_blocking(move || {
                    let mut manifest = manifest;
                    export_outputs(&store, &work, &mut manifest).map(|payload| (payload, manifest))
                })
                .await
                .map_err(join_error)??;
                info!(run_id = %run.run_id, files = payload.files.len(), output_path = %payload.output_path, "Outputs exported");
                Ok((StagePayload::Export(payload), manifest))
            }
        }
    }

    async fn probe_file(&self, file: String, timeout: Duration) -> FileAvailability {
        let path = match self.source.local_path(&file) {
            Ok(path) => path,
            Err(e) => return availability_failed(file, e.to_string()),
        };
        let adapter = match self.adapters.get_adapter_for_file(&path) {
            Ok(adapter) => adapter,
            Err(e) => return availability_failed(file, e.to_string()),
        };
        let task = tokio::task::spawn_blocking(move || adapter.probe_schema(&path));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(probe)) => availability_of(file, probe),
            Ok(Err(e)) => availability_failed(file, e.to_string()),
            Err(_) => {
                warn!(file = %file, timeout = ?timeout, "Probe timed out");
                availability_failed(file, format!("probe timed out after {} ms", timeout.as_millis()))
            }
        }
    }

    /// Reads at most `limit` bytes of a file as a JSON document.
    ///
    /// Files within the limit go through their adapter; a larger file's
    /// prefix is parsed as JSON and yields `None` when it does not parse.
    async fn sample_content(&self, file: String, limit: u64) -> Result<Option<Value>> {
        let source = Arc::clone(&self.source);
        let adapters = Arc::clone(&self.adapters);
        tokio::task::spawn_blocking(move || {
            let meta = source.metadata(&file)?;
            if meta.size <= limit {
                let path = source.local_path(&file)?;
                return adapters.get_adapter_for_file(&path)?.read_document(&path).map(Some);
            }
            let mut prefix = Vec::new();
            source
                .open(&file)?
                .take(limit)
                .read_to_end(&mut prefix)
                .map_err(|e| DatError::io(&file, e))?;
            Ok(serde_json::from_slice(&prefix).ok())
        })
        .await
        .map_err(join_error)?
    }

    async fn resolve_context(
        &self,
        selection: &SelectionPayload,
        profile: &Profile,
        overrides: BTreeMap<String, Value>,
    ) -> Result<ContextPayload> {
        let extractor = ContextExtractor::new(&profile.name, &profile.context)?;
        let limit = self.config.context_sample_bytes;
        let samples: Vec<(String, Result<Option<Value>>)> = stream::iter(selection.files.clone())
            .map(|file| async move {
                let content = self.sample_content(file.clone(), limit).await;
                (file, content)
            })
            .buffered(self.config.worker_pool_size)
            .collect()
            .await;

        let mut files = Vec::with_capacity(samples.len());
        for (file, content) in samples {
            let mut diagnostics = Vec::new();
            let content = content.unwrap_or_else(|e| {
                diagnostics.push(Diagnostic::from_error(&e).with_file(&file));
                None
            });
            let mut context = match extractor.extract(&file, content.as_ref(), &overrides) {
                Ok(context) => context,
                Err(e) => {
                    warn!(file = %file, error = %e, "Context extraction failed, using defaults");
                    diagnostics.push(Diagnostic::from_error(&e).with_file(&file));
                    extractor.defaults(&file)
                }
            };
            context.diagnostics.extend(diagnostics);
            files.push(context);
        }
        Ok(ContextPayload { overrides, files })
    }

    /// Loads one file as a document, streaming large files chunk by chunk.
    async fn load_document(&self, file: &str) -> Result<Value> {
        let path = self.source.local_path(file)?;
        let adapter = self.adapters.get_adapter_for_file(&path)?;
        let size = self.source.metadata(file)?.size;

        if size > self.config.stream_threshold_bytes && adapter.supports_streaming(&path) {
            debug!(file, size, "Streaming large file");
            let options = ReadOptions::default();
            let chunks = adapter.stream_dataframe(&path, &options, self.config.chunk_size)?;
            let mut stream = std::pin::pin!(chunk_stream(chunks));
            let mut records = Vec::new();
            while let Some(chunk) = stream.next().await {
                records.extend(chunk?.to_records());
            }
            return Ok(Value::Array(records));
        }

        tokio::task::spawn_blocking(move || adapter.read_document(&path))
            .await
            .map_err(join_error)?
    }

    /// Loads every selected file and resolves its context.
    ///
    /// Unreadable files become diagnostics. A locked Context stage supplies
    /// the context; otherwise it is resolved against the full document.
    async fn load_files(&self, sources: &Sources, diagnostics: &mut Vec<Diagnostic>) -> Result<Vec<LoadedFile>> {
        let extractor = ContextExtractor::new(&sources.profile.name, &sources.profile.context)?;
        let documents: Vec<(String, Result<Value>)> = stream::iter(sources.selection.files.clone())
            .map(|file| async move {
                let document = self.load_document(&file).await;
                (file, document)
            })
            .buffered(self.config.worker_pool_size)
            .collect()
            .await;

        let mut loaded = Vec::with_capacity(documents.len());
        for (file, document) in documents {
            let document = match document {
                Ok(document) => document,
                Err(e) => {
                    warn!(file = %file, error = %e, "File could not be loaded");
                    diagnostics.push(Diagnostic::from_error(&e).with_file(&file));
                    continue;
                }
            };
            let context = match &sources.context {
                Some(payload) => payload
                    .for_file(&file)
                    .cloned()
                    .unwrap_or_else(|| extractor.defaults(&file)),
                None => extractor
                    .extract(&file, Some(&document), &BTreeMap::new())
                    .unwrap_or_else(|e| {
                        diagnostics.push(Diagnostic::from_error(&e).with_file(&file));
                        extractor.defaults(&file)
                    }),
            };
            diagnostics.extend(context.diagnostics.iter().cloned());
            loaded.push(LoadedFile {
                file,
                document,
                context,
            });
        }
        Ok(loaded)
    }

    async fn preview(&self, sources: &Sources, max_rows: usize) -> Result<PreviewPayload> {
        let mut payload = PreviewPayload::default();
        let files = self.load_files(sources, &mut payload.diagnostics).await?;
        let definitions: Vec<TableDef> = sources
            .tables
            .iter()
            .filter_map(|id| sources.profile.table(id).cloned())
            .collect();

        let (tables, diagnostics) = tokio::task::spawn_blocking(move || {
            let mut tables = Vec::new();
            let mut diagnostics = Vec::new();
            for table in &definitions {
                for loaded in &files {
                    match extract_table(table, &loaded.document, &loaded.context) {
                        Ok(extracted) => tables.push(PreviewTable {
                            table_id: table.id.clone(),
                            source: loaded.file.clone(),
                            total_rows: extracted.row_count(),
                            rows: extracted.dataframe.head(max_rows).to_records(),
                            diagnostics: extracted.diagnostics,
                        }),
                        Err(e) => diagnostics
                            .push(Diagnostic::from_error(&e).with_table(&table.id).with_file(&loaded.file)),
                    }
                }
            }
            (tables, diagnostics)
        })
        .await
        .map_err(join_error)?;

        payload.tables = tables;
        payload.diagnostics.extend(diagnostics);
        Ok(payload)
    }

    /// Persists one table unit under the Parse artifact directory.
    fn commit_table(
        &self,
        dir: &Path,
        unit: TableUnit,
        payload: &mut ParsePayload,
        manifest: &mut ArtifactManifest,
        committed: &mut Vec<ExtractedTable>,
    ) -> Result<()> {
        let mut persist = |name: &str, parts: &[ExtractedTable]| -> Result<()> {
            let frames: Vec<DataFrame> = parts.iter().map(|t| t.dataframe.clone()).collect();
            let df = DataFrame::concat(&frames);
            let path = self.artifacts.write_table(dir, TABLES_DIR, name, &df)?;
            if let Some(path) = &path {
                manifest.files.push(path.clone());
            }
            manifest.row_counts.insert(format!("{TABLES_DIR}/{name}"), df.row_count());
            payload.tables.push(PersistedTable {
                name: name.to_string(),
                rows: df.row_count(),
                columns: df.columns().to_vec(),
                path,
            });
            Ok(())
        };

        persist(&unit.table_id, &unit.passed)?;
        if let Some(quarantine_id) = &unit.quarantine_id {
            if !unit.quarantined.is_empty() {
                persist(quarantine_id, &unit.quarantined)?;
            }
        }
        payload.validation.push(unit.report);
        payload.diagnostics.extend(unit.diagnostics);
        committed.extend(unit.passed);
        committed.extend(unit.quarantined);
        Ok(())
    }

    /// Runs Parse: tables are processed on a bounded worker pool and
    /// committed one at a time, in selection order, each followed by a
    /// TABLE_COMPLETE checkpoint and a cancellation poll.
    async fn parse(
        &self,
        run: &mut Run,
        id: &StageId,
        sources: &Sources,
        options: ParseOptions,
        manifest: ArtifactManifest,
        token: &CancellationToken,
    ) -> Result<(StagePayload, ArtifactManifest)> {
        let dir = self.artifacts.artifact_dir(&run.run_id, StageType::Parse, &id.id);
        if dir.exists() {
            // Leftovers of an attempt that never committed.
            std::fs::remove_dir_all(&dir).map_err(|e| DatError::io(&dir, e))?;
        }
        let mut manifest = manifest
            .with_sources(sources.selection.files.clone())
            .with_profile(&sources.selection.profile_id, sources.selection.profile_version);
        let mut payload = ParsePayload::default();

        let files = Arc::new(self.load_files(sources, &mut payload.diagnostics).await?);
        let profile = Arc::clone(&sources.profile);
        let max_rows = profile.governance.max_rows_per_table;
        let definitions: Vec<TableDef> = sources
            .tables
            .iter()
            .filter_map(|table_id| profile.table(table_id).cloned())
            .collect();

        let mut units = stream::iter(definitions)
            .map(|table| {
                let files = Arc::clone(&files);
                let profile = Arc::clone(&profile);
                let table_id = table.id.clone();
                async move {
                    let result =
                        tokio::task::spawn_blocking(move || process_table(&table, &files, &profile.filters, max_rows))
                            .await
                            .map_err(join_error)
                            .and_then(|r| r);
                    (table_id, result)
                }
            })
            .buffered(self.config.worker_pool_size);

        let mut committed = Vec::new();
        while let Some((table_id, result)) = units.next().await {
            let unit = match result {
                Ok(unit) => unit,
                Err(e) if options.fail_fast || matches!(e, DatError::Validation { .. }) => {
                    warn!(run_id = %run.run_id, table_id = %table_id, error = %e, "Table failed, aborting parse");
                    return Err(e);
                }
                Err(e) => {
                    warn!(run_id = %run.run_id, table_id = %table_id, error = %e, "Table failed");
                    payload.diagnostics.push(Diagnostic::from_error(&e).with_table(&table_id));
                    continue;
                }
            };
            self.commit_table(&dir, unit, &mut payload, &mut manifest, &mut committed)?;

            let checkpoint = run
                .checkpoints
                .mark_checkpoint(CheckpointType::TableComplete, format!("{}/{table_id}", id.id));
            self.runs.save(run)?;
            debug!(run_id = %run.run_id, table_id = %table_id, sequence = checkpoint.sequence, "Table committed");
            self.emit_checkpoint(&run.run_id, StageType::Parse, &checkpoint).await;
            token.check(StageType::Parse)?;
        }

        let outputs = build_outputs(&committed, &profile)?;
        for (name, df) in &outputs {
            let path = self.artifacts.write_table(&dir, OUTPUTS_DIR, name, df)?;
            if let Some(path) = &path {
                manifest.files.push(path.clone());
            }
            manifest.row_counts.insert(format!("{OUTPUTS_DIR}/{name}"), df.row_count());
            payload.outputs.push(PersistedTable {
                name: name.clone(),
                rows: df.row_count(),
                columns: df.columns().to_vec(),
                path,
            });
        }
        info!(
            run_id = %run.run_id,
            tables = payload.tables.len(),
            outputs = payload.outputs.len(),
            diagnostics = payload.diagnostics.len(),
            "Parse finished"
        );
        Ok((StagePayload::Parse(payload), manifest))
    }

    pub(super) async fn emit_checkpoint(
        &self,
        run_id: &str,
        stage: StageType,
        checkpoint: &crate::cancellation::Checkpoint,
    ) {
        self.emit(
            EventKind::CheckpointMarked,
            run_id,
            Some(stage),
            serde_json::json!({
                "checkpoint_type": checkpoint.checkpoint_type,
                "artifact_id": checkpoint.artifact_id,
                "sequence": checkpoint.sequence,
            }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loaded(file: &str, grid: Value) -> LoadedFile {
        LoadedFile {
            file: file.to_string(),
            document: json!({ "grid": grid }),
            context: ExtractionContext {
                file: file.to_string(),
                ..ExtractionContext::default()
            },
        }
    }

    #[test]
    fn test_relative_to_root() {
        assert_eq!(relative_to_root("data/a.csv", "data"), "a.csv");
        assert_eq!(relative_to_root("data/a.csv", ""), "data/a.csv");
        assert_eq!(relative_to_root("database/a.csv", "data"), "database/a.csv");
    }

    #[test]
    fn test_process_table_quarantines_and_transforms() {
        let profile = crate::profile::sample_profile();
        let table = profile.table("sites").unwrap();
        let files = vec![
            loaded("a.json", json!([["site", "x", "y"], [1, 1, 2], [2, -1, 3]])),
            loaded("b.json", json!([["site", "x", "y"], [3, 4, 5]])),
        ];
        let unit = process_table(table, &files, &profile.filters, None).unwrap();

        assert_eq!(unit.passed.len(), 2);
        assert_eq!(unit.passed[0].row_count() + unit.passed[1].row_count(), 2);
        assert!(unit.passed[0].dataframe.has_column("r"));
        assert_eq!(unit.quarantined.len(), 1);
        assert_eq!(unit.quarantined[0].table_id, "sites_rejected");
        assert_eq!(unit.report.input_rows, 3);
        assert_eq!(unit.report.quarantined_rows, 1);
    }

    fn grid_table(validation: Value) -> TableDef {
        serde_json::from_value(json!({
            "id": "sites",
            "extraction": {"strategy": "headers_data", "path": "$.grid"},
            "validation": validation
        }))
        .unwrap()
    }

    #[test]
    fn test_process_table_checks_unique_keys_across_files() {
        let table = grid_table(json!({
            "schema": [{"id": "site_unique", "check": "unique", "columns": ["site"]}],
            "aggregates": [{"id": "one_row", "stat": "count", "max": 1}]
        }));
        let files = vec![
            loaded("a.json", json!([["site", "x"], [1, 5]])),
            loaded("b.json", json!([["site", "x"], [1, 6]])),
        ];
        let err = process_table(&table, &files, &[], None).unwrap_err();
        let DatError::Validation { table_id, violations } = err else {
            panic!("expected a validation error");
        };
        assert_eq!(table_id, "sites");
        let ids: Vec<&str> = violations.iter().map(|v| v.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["site_unique", "one_row"]);
    }

    #[test]
    fn test_process_table_aggregates_over_whole_table() {
        let table = grid_table(json!({
            "aggregates": [{"id": "x_mean", "column": "x", "stat": "mean", "min": 4, "max": 6}]
        }));
        let files = vec![
            loaded("a.json", json!([["site", "x"], [1, 1]])),
            loaded("b.json", json!([["site", "x"], [2, 9]])),
        ];
        let unit = process_table(&table, &files, &[], None).unwrap();
        assert_eq!(unit.report.input_rows, 2);
        assert_eq!(unit.report.passed_rows, 2);
        assert!(unit.report.violations.is_empty());
        assert_eq!(unit.passed.len(), 2);
    }

    #[test]
    fn test_process_table_aggregate_quarantine_keeps_file_provenance() {
        let table = grid_table(json!({
            "aggregates": [{"id": "x_mean", "column": "x", "stat": "mean", "max": 2, "on_fail": "quarantine"}],
            "quarantine_table": "sites_rejected"
        }));
        let files = vec![
            loaded("a.json", json!([["site", "x"], [1, 1], [2, 2]])),
            loaded("b.json", json!([["site", "x"], [3, 9]])),
        ];
        let unit = process_table(&table, &files, &[], None).unwrap();
        assert!(unit.passed.iter().all(|t| t.row_count() == 0));
        let held: Vec<(&str, usize)> = unit
            .quarantined
            .iter()
            .map(|t| (t.source.as_str(), t.row_count()))
            .collect();
        assert_eq!(held, vec![("a.json", 2), ("b.json", 1)]);
        assert_eq!(unit.report.quarantined_rows, 3);
    }

    #[test]
    fn test_process_table_enforces_row_limit() {
        let profile = crate::profile::sample_profile();
        let table = profile.table("sites").unwrap();
        let files = vec![
            loaded("a.json", json!([["site", "x", "y"], [1, 1, 2], [2, 1, 3]])),
            loaded("b.json", json!([["site", "x", "y"], [3, 4, 5]])),
        ];
        let unit = process_table(table, &files, &profile.filters, Some(2)).unwrap();
        let rows: usize = unit.passed.iter().map(ExtractedTable::row_count).sum();
        assert_eq!(rows, 2);
        assert!(unit.diagnostics.iter().any(|d| d.code == "DAT-GOVERNANCE"));
    }

    #[test]
    fn test_process_table_skips_unreadable_file() {
        let profile = crate::profile::sample_profile();
        let table = profile.table("sites").unwrap();
        let files = vec![
            loaded("a.json", json!([["site", "x", "y"], [1, 1, 2]])),
            loaded("b.json", json!("not a grid")),
        ];
        let unit = process_table(table, &files, &profile.filters, None).unwrap();
        assert_eq!(unit.passed.len(), 1);
        assert!(unit.diagnostics.iter().any(|d| d.file.as_deref() == Some("b.json")));
    }

    #[test]
    fn test_write_export_formats() {
        let dir = tempfile::tempdir().unwrap();
        let df = DataFrame::from_rows(
            vec!["site".to_string(), "lot".to_string()],
            vec![vec![json!(1), json!("A")], vec![json!(2), Value::Null]],
        );

        let csv_path = dir.path().join("out.csv");
        write_export(&df, ExportFormat::Csv, &csv_path).unwrap();
        assert_eq!(std::fs::read_to_string(&csv_path).unwrap(), "site,lot\n1,A\n2,\n");

        let json_path = dir.path().join("out.json");
        write_export(&df, ExportFormat::Json, &json_path).unwrap();
        let records: Value = serde_json::from_slice(&std::fs::read(&json_path).unwrap()).unwrap();
        assert_eq!(records, json!([{"site": 1, "lot": "A"}, {"site": 2, "lot": null}]));

        let parquet_path = dir.path().join("out.parquet");
        write_export(&df, ExportFormat::Parquet, &parquet_path).unwrap();
        assert_eq!(crate::frame::arrow::read_parquet(&parquet_path).unwrap(), df);
    }
}
