//! End-to-end tests of the orchestrator over a temporary workspace.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use super::*;
use crate::core::TableStatus;
use crate::events::CollectingEventSink;
use crate::profile::{sample_profile, PopulationStrategy, Profile};
use crate::core::StageType::*;

const PROFILE: &str = "wafer-sites";

struct Fixture {
    dir: TempDir,
    dat: Orchestrator,
    events: Arc<CollectingEventSink>,
}

impl Fixture {
    fn root(&self) -> &Path {
        self.dir.path()
    }
}

fn write_wafer(root: &Path, name: &str, sites: &[(i64, i64, i64)]) {
    let mut grid = vec![json!(["site", "x", "y"])];
    grid.extend(sites.iter().map(|(site, x, y)| json!([site, x, y])));
    let path = root.join("data").join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_vec(&json!({ "grid": grid })).unwrap()).unwrap();
}

fn fixture_with(profiles: Vec<Profile>, sink: Option<Arc<dyn EventSink>>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    write_wafer(dir.path(), "lot_A1_wafer1.json", &[(1, 1, 2), (2, 3, 4)]);
    write_wafer(dir.path(), "lot_A1_wafer2.json", &[(3, -1, 5), (4, 2, 2)]);
    write_wafer(dir.path(), "lot_B2_wafer3.json", &[(5, 1, 0)]);
    std::fs::write(dir.path().join("data/notes.bin"), "not data").unwrap();

    let store = ProfileStore::new();
    store.create(sample_profile()).unwrap();
    for profile in profiles {
        store.create(profile).unwrap();
    }

    let events = Arc::new(CollectingEventSink::new());
    let sink = sink.unwrap_or_else(|| Arc::clone(&events) as Arc<dyn EventSink>);
    let dat = Orchestrator::new(dir.path(), Arc::new(store), DatConfig::default())
        .unwrap()
        .with_event_sink(sink);
    Fixture { dir, dat, events }
}

fn fixture() -> Fixture {
    fixture_with(Vec::new(), None)
}

async fn lock_to_table_selection(dat: &Orchestrator, run_id: &str, profile: &str) {
    dat.lock(run_id, StageRequest::discovery("data")).await.unwrap();
    dat.lock(run_id, StageRequest::selection(Vec::<String>::new(), profile))
        .await
        .unwrap();
    dat.lock(
        run_id,
        StageRequest::TableAvailability {
            probe: ProbeOptions::default(),
        },
    )
    .await
    .unwrap();
    dat.lock(run_id, StageRequest::tables(Vec::<String>::new())).await.unwrap();
}

fn gating_dependency(err: &DatError) -> Option<StageType> {
    match err {
        DatError::Gating { unmet_dependency, .. } => *unmet_dependency,
        other => panic!("expected a gating error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_full_run_produces_exports() {
    let fx = fixture();
    let run = fx.dat.create_run().await.unwrap();
    let run_id = run.run_id.as_str();
    assert_eq!(fx.dat.current_stage(run_id).unwrap(), Discovery);

    let discovered = fx.dat.lock(run_id, StageRequest::discovery("data")).await.unwrap();
    assert!(!discovered.reused);
    assert_eq!(discovered.manifest.as_ref().unwrap().row_counts["files"], 4);

    fx.dat
        .lock(run_id, StageRequest::selection(Vec::<String>::new(), PROFILE))
        .await
        .unwrap();
    let selection: SelectionPayload = fx.dat.payload(run_id, Selection).unwrap().unwrap().try_into().unwrap();
    assert_eq!(
        selection.files,
        vec!["data/lot_A1_wafer1.json", "data/lot_A1_wafer2.json", "data/lot_B2_wafer3.json"]
    );
    assert_eq!(selection.profile_version, 1);

    fx.dat
        .lock(run_id, StageRequest::Context { overrides: BTreeMap::new() })
        .await
        .unwrap();
    let context: ContextPayload = fx.dat.payload(run_id, Context).unwrap().unwrap().try_into().unwrap();
    let lots: Vec<Value> = context.files.iter().map(|c| c.get("lot").cloned().unwrap()).collect();
    assert_eq!(lots, vec![json!("A1"), json!("A1"), json!("B2")]);

    fx.dat
        .lock(
            run_id,
            StageRequest::TableAvailability {
                probe: ProbeOptions::default(),
            },
        )
        .await
        .unwrap();
    let availability = fx.dat.table_availability(run_id).unwrap();
    assert!(availability.files.iter().all(|f| f.status == TableStatus::Available));
    assert_eq!(availability.tables, vec!["sites"]);

    fx.dat.lock(run_id, StageRequest::tables(Vec::<String>::new())).await.unwrap();
    fx.dat.lock(run_id, StageRequest::parse()).await.unwrap();
    assert_eq!(fx.dat.current_stage(run_id).unwrap(), Parse);

    let parse = fx.dat.parse_results(run_id).unwrap();
    assert_eq!(parse.table("sites").unwrap().rows, 4);
    assert_eq!(parse.table("sites_rejected").unwrap().rows, 1);
    assert_eq!(parse.validation[0].quarantined_rows, 1);

    let sites = fx.dat.read_output(run_id, "all_sites").unwrap();
    assert_eq!(sites.row_count(), 4);
    assert!(sites.has_column("lot"));
    assert!(sites.has_column("r"));
    let rejected = fx.dat.read_table(run_id, "sites_rejected").unwrap();
    assert_eq!(rejected.get(0, "x"), Some(&json!(-1)));

    fx.dat.complete(run_id, Parse).await.unwrap();
    assert_eq!(fx.dat.current_stage(run_id).unwrap(), Export);

    fx.dat
        .lock(run_id, StageRequest::export(&[ExportFormat::Csv, ExportFormat::Json], "exports"))
        .await
        .unwrap();
    let export: ExportPayload = fx.dat.payload(run_id, Export).unwrap().unwrap().try_into().unwrap();
    let paths: Vec<&str> = export.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["exports/all_sites.csv", "exports/all_sites.json"]);
    assert!(fx.root().join("exports/manifest.json").is_file());

    let csv = std::fs::read_to_string(fx.root().join("exports/all_sites.csv")).unwrap();
    assert_eq!(csv.lines().count(), 5);

    assert_eq!(fx.events.of_kind(EventKind::StageLocked).len(), 7);
    assert_eq!(fx.events.of_kind(EventKind::StageCompleted).len(), 1);
}

#[tokio::test]
async fn test_gating_names_unmet_dependency() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;

    let err = fx
        .dat
        .lock(&run_id, StageRequest::selection(Vec::<String>::new(), PROFILE))
        .await
        .unwrap_err();
    assert_eq!(gating_dependency(&err), Some(Discovery));
    assert_eq!(fx.dat.can_lock(&run_id, Selection).unwrap(), (false, Some(Discovery)));

    lock_to_table_selection(&fx.dat, &run_id, PROFILE).await;
    fx.dat.lock(&run_id, StageRequest::parse()).await.unwrap();

    let err = fx
        .dat
        .lock(&run_id, StageRequest::export(&[ExportFormat::Csv], "out"))
        .await
        .unwrap_err();
    assert_eq!(gating_dependency(&err), Some(Parse));
    assert!(err.to_string().contains("COMPLETED"));

    assert!(fx.dat.skip(&run_id, Parse).await.is_err());
    assert!(fx.dat.complete(&run_id, Export).await.is_err());
}

#[tokio::test]
async fn test_relock_is_idempotent_and_reuses_artifacts() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;

    let first = fx.dat.lock(&run_id, StageRequest::discovery("data")).await.unwrap();
    let again = fx.dat.lock(&run_id, StageRequest::discovery("./data")).await.unwrap();
    assert!(again.reused);
    assert_eq!(again.stage_id, first.stage_id);

    let changed = StageRequest::Discovery {
        root: "data".to_string(),
        include: vec!["*.json".to_string()],
        exclude: Vec::new(),
        recursive: true,
    };
    let err = fx.dat.lock(&run_id, changed).await.unwrap_err();
    assert!(matches!(err, DatError::Gating { .. }));

    fx.dat.unlock(&run_id, Discovery).await.unwrap();
    let relocked = fx.dat.lock(&run_id, StageRequest::discovery("data")).await.unwrap();
    assert!(relocked.reused);
    assert_eq!(relocked.stage_id, first.stage_id);
    assert_eq!(fx.events.of_kind(EventKind::StageReused).len(), 1);
}

#[tokio::test]
async fn test_stage_ids_are_stable_across_runs() {
    let fx = fixture();
    let a = fx.dat.create_run().await.unwrap().run_id;
    let b = fx.dat.create_run().await.unwrap().run_id;
    lock_to_table_selection(&fx.dat, &a, PROFILE).await;
    lock_to_table_selection(&fx.dat, &b, PROFILE).await;

    let (run_a, run_b) = (fx.dat.status(&a).unwrap(), fx.dat.status(&b).unwrap());
    for stage in [Discovery, Selection, TableAvailability, TableSelection] {
        let id_a = &run_a.stage(stage).unwrap().stage_id;
        assert!(id_a.is_some());
        assert_eq!(id_a, &run_b.stage(stage).unwrap().stage_id, "{stage}");
    }
}

#[tokio::test]
async fn test_unlock_cascades_and_keeps_artifacts() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    lock_to_table_selection(&fx.dat, &run_id, PROFILE).await;
    fx.dat.lock(&run_id, StageRequest::parse()).await.unwrap();

    let cascaded = fx.dat.unlock(&run_id, TableSelection).await.unwrap();
    assert_eq!(cascaded, vec![Preview, Parse, Export]);

    let run = fx.dat.status(&run_id).unwrap();
    assert_eq!(run.status_of(TableAvailability), StageStatus::Locked);
    assert_eq!(run.status_of(TableSelection), StageStatus::Unlocked);
    assert_eq!(run.status_of(Parse), StageStatus::Unlocked);
    assert!(run.stage(Parse).unwrap().stage_id.is_none());
    assert!(fx.dat.artifact(&run_id, Parse).unwrap().is_some());
    assert!(fx.dat.payload(&run_id, Parse).unwrap().is_none());

    let err = fx.dat.unlock(&run_id, Parse).await.unwrap_err();
    assert!(matches!(err, DatError::Gating { .. }));

    let cascaded = fx.dat.unlock(&run_id, Discovery).await.unwrap();
    assert_eq!(
        cascaded,
        vec![Selection, Context, TableAvailability, TableSelection, Preview, Parse, Export]
    );
    let run = fx.dat.status(&run_id).unwrap();
    assert!(run.stages.values().all(|s| s.status == StageStatus::Unlocked));
    assert_eq!(fx.events.of_kind(EventKind::StageCascadeUnlocked).len(), 2);
}

#[tokio::test]
async fn test_unlock_selection_cascades_to_six_stages() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    lock_to_table_selection(&fx.dat, &run_id, PROFILE).await;
    fx.dat.lock(&run_id, StageRequest::parse()).await.unwrap();

    let cascaded = fx.dat.unlock(&run_id, Selection).await.unwrap();
    assert_eq!(
        cascaded,
        vec![Context, TableAvailability, TableSelection, Preview, Parse, Export]
    );

    let run = fx.dat.status(&run_id).unwrap();
    assert_eq!(run.status_of(Discovery), StageStatus::Locked);
    assert!(run.stage(Discovery).unwrap().stage_id.is_some());
    for stage in [Selection, Context, TableAvailability, TableSelection, Preview, Parse, Export] {
        assert_eq!(run.status_of(stage), StageStatus::Unlocked, "{stage}");
    }
    assert!(fx.dat.artifact(&run_id, TableAvailability).unwrap().is_some());
}

#[tokio::test]
async fn test_tampered_manifest_is_a_determinism_conflict() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    let locked = fx.dat.lock(&run_id, StageRequest::discovery("data")).await.unwrap();
    fx.dat.unlock(&run_id, Discovery).await.unwrap();

    let path = fx
        .dat
        .artifacts
        .artifact_dir(&run_id, Discovery, &locked.stage_id)
        .join("manifest.json");
    let mut manifest: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    manifest["input_hash"] = json!("0000");
    std::fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();

    let err = fx.dat.lock(&run_id, StageRequest::discovery("data")).await.unwrap_err();
    assert!(matches!(err, DatError::DeterminismConflict { .. }));
    assert!(err.is_orchestration());
    assert_eq!(fx.dat.status(&run_id).unwrap().status_of(Discovery), StageStatus::Unlocked);
}

#[tokio::test]
async fn test_skip_optional_stages() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;

    let err = fx.dat.skip(&run_id, Context).await.unwrap_err();
    assert_eq!(gating_dependency(&err), Some(Selection));

    lock_to_table_selection(&fx.dat, &run_id, PROFILE).await;
    let skipped = fx.dat.skip(&run_id, Context).await.unwrap();
    assert_eq!(skipped.status, StageStatus::Completed);
    assert!(skipped.manifest.is_none());
    fx.dat.skip(&run_id, Preview).await.unwrap();

    let run = fx.dat.status(&run_id).unwrap();
    assert!(run.stage(Context).unwrap().artifact_id.is_none());
    assert_eq!(fx.dat.current_stage(&run_id).unwrap(), Parse);
    assert!(fx.dat.skip(&run_id, Context).await.is_err());

    fx.dat.lock(&run_id, StageRequest::parse()).await.unwrap();
    let sites = fx.dat.read_output(&run_id, "all_sites").unwrap();
    assert_eq!(sites.get(0, "lot"), Some(&json!("A1")));
    assert_eq!(fx.events.of_kind(EventKind::StageSkipped).len(), 2);
}

#[tokio::test]
async fn test_context_overrides_are_checked() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    lock_to_table_selection(&fx.dat, &run_id, PROFILE).await;

    let mut overrides = BTreeMap::new();
    overrides.insert("operator".to_string(), json!("ann"));
    let err = fx
        .dat
        .lock(&run_id, StageRequest::Context { overrides: overrides.clone() })
        .await
        .unwrap_err();
    assert!(matches!(err, DatError::OverrideRejected { .. }));

    overrides.clear();
    overrides.insert("lot".to_string(), json!("Z9"));
    fx.dat
        .lock(&run_id, StageRequest::Context { overrides })
        .await
        .unwrap();
    assert_eq!(fx.dat.status(&run_id).unwrap().context["lot"], json!("Z9"));

    fx.dat.lock(&run_id, StageRequest::parse()).await.unwrap();
    let sites = fx.dat.read_output(&run_id, "all_sites").unwrap();
    assert!((0..sites.row_count()).all(|row| sites.get(row, "lot") == Some(&json!("Z9"))));
}

#[tokio::test]
async fn test_preview_samples_rows() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    lock_to_table_selection(&fx.dat, &run_id, PROFILE).await;

    fx.dat.lock(&run_id, StageRequest::Preview { max_rows: 1 }).await.unwrap();
    let preview: PreviewPayload = fx.dat.payload(&run_id, Preview).unwrap().unwrap().try_into().unwrap();
    assert_eq!(preview.tables.len(), 3);
    assert!(preview.tables.iter().all(|t| t.rows.len() == 1));
    assert_eq!(preview.tables[0].total_rows, 2);
}

#[tokio::test]
async fn test_unreadable_file_is_reported_not_fatal() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    fx.dat.lock(&run_id, StageRequest::discovery("data")).await.unwrap();
    fx.dat
        .lock(
            &run_id,
            StageRequest::selection(["data/notes.bin", "data/lot_A1_wafer1.json"], PROFILE),
        )
        .await
        .unwrap();
    fx.dat
        .lock(
            &run_id,
            StageRequest::TableAvailability {
                probe: ProbeOptions { timeout_ms: Some(5_000) },
            },
        )
        .await
        .unwrap();

    let availability = fx.dat.table_availability(&run_id).unwrap();
    let statuses: Vec<TableStatus> = availability.files.iter().map(|f| f.status).collect();
    assert_eq!(statuses, vec![TableStatus::Available, TableStatus::Error]);
    assert!(availability.files[1].error.is_some());
    assert_eq!(availability.tables, vec!["sites"]);

    fx.dat.lock(&run_id, StageRequest::tables(["sites"])).await.unwrap();
    fx.dat.lock(&run_id, StageRequest::parse()).await.unwrap();
    let parse = fx.dat.parse_results(&run_id).unwrap();
    assert_eq!(parse.table("sites").unwrap().rows, 2);
    assert!(parse.diagnostics.iter().any(|d| d.file.as_deref() == Some("data/notes.bin")));
}

#[tokio::test]
async fn test_selection_rules() {
    let mut capped = sample_profile();
    capped.name = "capped".to_string();
    capped.governance.max_files = Some(2);
    let mut first = sample_profile();
    first.name = "first-one".to_string();
    first.population = PopulationStrategy::FirstN { n: 1 };

    let fx = fixture_with(vec![capped, first], None);
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    fx.dat.lock(&run_id, StageRequest::discovery("data")).await.unwrap();

    let err = fx
        .dat
        .lock(&run_id, StageRequest::selection(Vec::<String>::new(), "capped"))
        .await
        .unwrap_err();
    assert!(matches!(err, DatError::Gating { .. }));

    let err = fx
        .dat
        .lock(&run_id, StageRequest::selection(["data/missing.json"], PROFILE))
        .await
        .unwrap_err();
    assert!(matches!(err, DatError::Input { .. }));

    fx.dat
        .lock(&run_id, StageRequest::selection(Vec::<String>::new(), "first-one"))
        .await
        .unwrap();
    let selection: SelectionPayload = fx.dat.payload(&run_id, Selection).unwrap().unwrap().try_into().unwrap();
    assert_eq!(selection.files, vec!["data/lot_A1_wafer1.json"]);
}

#[tokio::test]
async fn test_table_selection_rejects_unavailable_tables() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    lock_to_table_selection(&fx.dat, &run_id, PROFILE).await;
    fx.dat.unlock(&run_id, TableSelection).await.unwrap();

    let err = fx.dat.lock(&run_id, StageRequest::tables(["ghost"])).await.unwrap_err();
    assert!(matches!(err, DatError::Gating { .. }));
}

#[tokio::test]
async fn test_archived_run_is_read_only() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    fx.dat.lock(&run_id, StageRequest::discovery("data")).await.unwrap();
    let archived = fx.dat.archive_run(&run_id).await.unwrap();
    assert!(archived.is_archived());

    assert!(fx.dat.unlock(&run_id, Discovery).await.is_err());
    assert!(fx
        .dat
        .lock(&run_id, StageRequest::selection(Vec::<String>::new(), PROFILE))
        .await
        .is_err());
    assert_eq!(fx.dat.can_lock(&run_id, Selection).unwrap(), (false, None));
    assert_eq!(fx.events.of_kind(EventKind::RunArchived).len(), 1);
}

#[tokio::test]
async fn test_cleanup_protects_locked_artifacts() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    let old = fx.dat.lock(&run_id, StageRequest::discovery("data")).await.unwrap();
    fx.dat.unlock(&run_id, Discovery).await.unwrap();
    let current = fx
        .dat
        .lock(
            &run_id,
            StageRequest::Discovery {
                root: "data".to_string(),
                include: vec!["*.json".to_string()],
                exclude: Vec::new(),
                recursive: true,
            },
        )
        .await
        .unwrap();
    assert_ne!(old.stage_id, current.stage_id);

    let old_dir = fx.dat.artifacts.artifact_dir(&run_id, Discovery, &old.stage_id);
    let dry = fx.dat.cleanup(&run_id, &[CleanupTarget::All], true).await.unwrap();
    assert_eq!(dry.removed, vec![fx.dat.artifacts.relative(&old_dir).unwrap()]);
    assert_eq!(dry.protected.len(), 1);
    assert!(old_dir.exists());

    let done = fx
        .dat
        .cleanup(&run_id, &[CleanupTarget::Stage { stage: Discovery }], false)
        .await
        .unwrap();
    assert_eq!(done.removed.len(), 1);
    assert!(!old_dir.exists());
    assert!(fx.dat.payload(&run_id, Discovery).unwrap().is_some());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let fx = fixture();
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    fx.dat.lock(&run_id, StageRequest::discovery("data")).await.unwrap();

    let reopened = Orchestrator::new(fx.root(), Arc::clone(fx.dat.profiles()), DatConfig::default()).unwrap();
    assert_eq!(reopened.list_runs().unwrap(), vec![run_id.clone()]);
    assert_eq!(reopened.status(&run_id).unwrap().status_of(Discovery), StageStatus::Locked);
    assert!(matches!(reopened.status("nope"), Err(DatError::RunNotFound(_))));
}

/// Cancels a token once a number of TABLE_COMPLETE checkpoints were seen.
struct CancelAfterTables {
    token: CancellationToken,
    after: usize,
    seen: AtomicUsize,
}

#[async_trait]
impl EventSink for CancelAfterTables {
    async fn emit(&self, event: &DatEvent) {
        if event.kind == EventKind::CheckpointMarked
            && event.data["checkpoint_type"] == "TABLE_COMPLETE"
            && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after
        {
            self.token.cancel("stopped by user");
        }
    }
}

fn five_tables() -> Profile {
    let tables: Vec<Value> = (1..=5)
        .map(|i| json!({"id": format!("t{i}"), "extraction": {"strategy": "headers_data", "path": "$.grid"}}))
        .collect();
    serde_json::from_value(json!({
        "name": "five-tables",
        "datasource": {"include": ["*.json"]},
        "tables": tables
    }))
    .unwrap()
}

#[tokio::test]
async fn test_cancellation_keeps_committed_tables() {
    let token = CancellationToken::new();
    let sink: Arc<dyn EventSink> = Arc::new(CancelAfterTables {
        token: token.clone(),
        after: 2,
        seen: AtomicUsize::new(0),
    });
    let fx = fixture_with(vec![five_tables()], Some(sink));
    let run_id = fx.dat.create_run().await.unwrap().run_id;
    lock_to_table_selection(&fx.dat, &run_id, "five-tables").await;

    let planned = fx.dat.resolve_inputs(&run_id, StageRequest::parse()).unwrap();
    let parse_id = planned.stage_id(fx.dat.config().id_length).id;

    let err = fx
        .dat
        .lock_with_token(&run_id, StageRequest::parse(), token)
        .await
        .unwrap_err();
    assert!(matches!(err, DatError::Cancellation { stage: Parse, .. }));

    let run = fx.dat.status(&run_id).unwrap();
    assert_eq!(run.status_of(Parse), StageStatus::Unlocked);
    assert_eq!(
        run.checkpoints
            .matching(CheckpointType::TableComplete, &parse_id)
            .count(),
        2
    );

    let dir = fx.dat.artifacts.artifact_dir(&run_id, Parse, &parse_id);
    let mut written: Vec<String> = std::fs::read_dir(dir.join(TABLES_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    written.sort();
    assert_eq!(written, vec!["t1.parquet", "t2.parquet"]);
    assert!(!dir.join("manifest.json").exists());
    assert!(!fx.dat.cancel(&run_id, "nothing running"));
}
