//! Integration tests for resuming runs across orchestrator instances

use super::test_utils::{fast_config, new_run, orchestrator};
use blueprint::error::{PipelineError, ProviderError};
use blueprint::orchestrator::RunControl;
use blueprint::pipeline::{RunStatus, StageStatus};
use blueprint::provider::{ScriptStep, ScriptedProvider};
use std::sync::Arc;
use tempfile::TempDir;

fn failing_phase_two() -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::echo().script(
        "r1/phases/phase-2",
        vec![
            ScriptStep::Fail(ProviderError::network("reset")),
            ScriptStep::TokensThenFail(vec!["half ".into()], ProviderError::network("reset")),
            ScriptStep::Fail(ProviderError::network("reset")),
        ],
    ))
}

#[tokio::test]
async fn test_new_process_resumes_only_unfinished_work() {
    let dir = TempDir::new().unwrap();
    let config = fast_config();

    let first = failing_phase_two();
    {
        let orchestrator = orchestrator(&config, first.clone(), &dir, None);
        let run = orchestrator
            .execute(new_run(&config, "r1", "Build a queue"), &RunControl::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let phases = run.stage("phases").unwrap();
        assert_eq!(phases.status, StageStatus::Failed);
        let failure = phases.failure.clone().unwrap();
        assert_eq!(failure.category, "transient_network");
        assert_eq!(failure.attempts, 3);
        assert_eq!(first.calls_for("r1/phases/phase-1"), 1);
        assert_eq!(first.calls_for("r1/handoff"), 0);
    }

    let second = Arc::new(ScriptedProvider::echo());
    let orchestrator = orchestrator(&config, second.clone(), &dir, None);
    let resumed = orchestrator.resume("r1", &RunControl::new()).await.unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.stage("phases").unwrap().retry_count, 1);
    assert_eq!(second.calls_for("r1/design"), 0);
    assert_eq!(second.calls_for("r1/plan"), 0);
    assert_eq!(second.calls_for("r1/phases/phase-1"), 0);
    assert_eq!(second.calls_for("r1/phases/phase-2"), 1);
    assert_eq!(second.calls_for("r1/handoff"), 1);
    assert_eq!(orchestrator.store().load("r1").unwrap(), resumed);
}

#[tokio::test]
async fn test_corrupt_primary_resumes_from_backup() {
    let dir = TempDir::new().unwrap();
    let config = fast_config();
    {
        let orchestrator = orchestrator(&config, failing_phase_two(), &dir, None);
        let run = orchestrator
            .execute(new_run(&config, "r1", "Build a queue"), &RunControl::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        std::fs::write(orchestrator.store().path_for("r1"), b"{\"format\": 1").unwrap();
    }

    let provider = Arc::new(ScriptedProvider::echo());
    let orchestrator = orchestrator(&config, provider.clone(), &dir, None);
    let resumed = orchestrator.resume("r1", &RunControl::new()).await.unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.stage("phases").unwrap().retry_count, 0);
    assert_eq!(provider.calls_for("r1/plan"), 0);
    assert_eq!(provider.calls_for("r1/phases/phase-1"), 1);
    assert!(orchestrator.store().load("r1").is_ok());
    let backup = orchestrator.store().load_backup("r1").unwrap();
    assert_eq!(backup.completed_stages(), 3);
}

#[tokio::test]
async fn test_unknown_run_cannot_resume() {
    let dir = TempDir::new().unwrap();
    let config = fast_config();
    let orchestrator = orchestrator(&config, Arc::new(ScriptedProvider::echo()), &dir, None);

    let err = orchestrator
        .resume("does-not-exist", &RunControl::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRun(_)));
}

#[tokio::test]
async fn test_created_run_is_resumable_from_pending() {
    let dir = TempDir::new().unwrap();
    let config = fast_config();
    let provider = Arc::new(ScriptedProvider::echo());
    let orchestrator = orchestrator(&config, provider.clone(), &dir, None);

    let created = orchestrator.create_run("Build a scheduler").unwrap();
    assert_eq!(created.status, RunStatus::Pending);
    assert_eq!(orchestrator.store().list().unwrap().len(), 1);

    let run = orchestrator.resume(&created.id, &RunControl::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.brief, "Build a scheduler");
}
