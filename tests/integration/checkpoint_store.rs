//! Integration tests for checkpoint persistence, validation and recovery

use blueprint::checkpoint::{CheckpointSchema, CheckpointStore, Recovery};
use blueprint::error::CheckpointError;
use blueprint::pipeline::{PipelineConfig, PipelineRun, RunStatus, StageStatus};
use blueprint::swarm::SwarmConfig;
use std::collections::HashMap;
use tempfile::TempDir;

fn run(id: &str) -> PipelineRun {
    PipelineRun::new(
        id,
        "Build a rate limiter",
        &PipelineConfig::default().definitions(),
        &SwarmConfig::default(),
    )
}

fn complete_design(run: &mut PipelineRun, output: &str) {
    run.stages[0].status = StageStatus::Complete;
    run.stages[0].output = Some(output.to_string());
    run.current_stage = 1;
    run.status = RunStatus::Paused;
}

#[test]
fn test_save_load_preserves_run() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), CheckpointSchema::default()).unwrap();
    let mut run = run("run-a");
    complete_design(&mut run, "# Design\nbody");

    store.save(&run).unwrap();
    assert_eq!(store.load("run-a").unwrap(), run);
    assert!(store.validate_file(&store.path_for("run-a")).is_ok());
}

#[test]
fn test_in_flight_stage_is_never_persisted() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), CheckpointSchema::default()).unwrap();
    let mut run = run("run-b");
    run.stages[0].status = StageStatus::Running;

    assert!(matches!(store.save(&run), Err(CheckpointError::MidStage { .. })));
    assert!(!store.path_for("run-b").exists());
}

#[test]
fn test_tampered_primary_recovers_from_backup() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), CheckpointSchema::default()).unwrap();
    let mut run = run("run-c");
    store.save(&run).unwrap();
    complete_design(&mut run, "# Design\nbody");
    store.save(&run).unwrap();

    let path = store.path_for("run-c");
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("# Design", "# Tampered")).unwrap();

    match store.load("run-c") {
        Err(CheckpointError::Corruption { reason, .. }) => assert!(reason.contains("checksum")),
        other => panic!("expected corruption, got {:?}", other.map(|r| r.id)),
    }
    match store.recover("run-c").unwrap() {
        Recovery::Backup { run, primary_error } => {
            assert_eq!(run.completed_stages(), 0);
            assert!(primary_error.contains("checksum"));
        }
        _ => panic!("expected backup recovery"),
    }
}

#[test]
fn test_unrecoverable_run_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), CheckpointSchema::default()).unwrap();
    std::fs::write(store.path_for("run-d"), b"{not json").unwrap();

    assert!(matches!(store.recover("run-d").unwrap(), Recovery::Fresh { .. }));
    assert!(matches!(store.recover("missing").unwrap(), Recovery::Fresh { .. }));
}

#[test]
fn test_output_markers_reject_incomplete_stage() {
    let dir = TempDir::new().unwrap();
    let mut markers = HashMap::new();
    markers.insert("design".to_string(), vec!["## Architecture".to_string()]);
    let strict = CheckpointStore::new(
        dir.path(),
        CheckpointSchema {
            output_markers: markers,
            ..CheckpointSchema::default()
        },
    )
    .unwrap();
    let lenient = CheckpointStore::new(dir.path(), CheckpointSchema::default()).unwrap();

    let mut run = run("run-e");
    complete_design(&mut run, "# Design\nno architecture section");
    lenient.save(&run).unwrap();

    assert!(lenient.load("run-e").is_ok());
    match strict.load("run-e") {
        Err(CheckpointError::Corruption { reason, .. }) => assert!(reason.contains("## Architecture")),
        other => panic!("expected marker failure, got {:?}", other.map(|r| r.id)),
    }
}

#[test]
fn test_list_skips_unreadable_and_orders_by_update() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), CheckpointSchema::default()).unwrap();
    let older = run("run-old");
    store.save(&older).unwrap();
    let mut newer = run("run-new");
    newer.updated_at = older.updated_at + chrono::Duration::seconds(5);
    store.save(&newer).unwrap();
    std::fs::write(store.path_for("run-bad"), b"garbage").unwrap();

    let ids: Vec<String> = store.list().unwrap().into_iter().map(|s| s.run_id).collect();
    assert_eq!(ids, vec!["run-new".to_string(), "run-old".to_string()]);

    assert!(store.remove("run-old").unwrap());
    assert!(!store.remove("run-old").unwrap());
}
