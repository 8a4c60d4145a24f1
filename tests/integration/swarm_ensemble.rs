//! Integration tests for ensemble stages driven through the orchestrator

use super::test_utils::{fast_config, new_run, orchestrator};
use blueprint::error::ProviderError;
use blueprint::orchestrator::RunControl;
use blueprint::pipeline::RunStatus;
use blueprint::provider::{ScriptStep, ScriptedProvider};
use blueprint::telemetry::{EventContext, MemorySink, ProgressRuntime};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_ensemble_stage_stores_arbiter_synthesis() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.swarm.stages = vec!["design".to_string()];
    config.swarm.drones = 3;

    let provider = Arc::new(
        ScriptedProvider::echo()
            .script(
                "r1/design",
                vec![ScriptStep::text(
                    "# Merged design\n\nBest of A and C.\n\nCONFIDENCE: 0.9\nSTATUS: approved\nRATIONALE: A had the cleaner storage model.\n",
                )],
            )
            .script_prefix(
                "r1/design/drone-",
                vec![
                    ScriptStep::text("draft A"),
                    ScriptStep::text("draft B"),
                    ScriptStep::text("draft C"),
                ],
            ),
    );
    let sink = Arc::new(MemorySink::default());
    let events = EventContext::new("s1", ProgressRuntime::new(vec![sink.clone()]));
    let orchestrator = orchestrator(&config, provider.clone(), &dir, Some(events));

    let run = orchestrator
        .execute(new_run(&config, "r1", "Build a cache"), &RunControl::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let design = run.stage("design").unwrap();
    assert!(design.ensemble);
    let output = design.output.as_deref().unwrap();
    assert!(output.starts_with("# Merged design"));
    assert!(!output.contains("CONFIDENCE:"));

    for drone in 1..=3 {
        assert_eq!(provider.calls_for(&format!("r1/design/drone-{}", drone)), 1);
    }
    assert_eq!(provider.calls_for("r1/design"), 1);
    assert_eq!(provider.calls_for("r1/design/critique-1"), 0);
    assert!(!run.stage("plan").unwrap().ensemble);

    let arbiter_prompt = provider
        .calls()
        .into_iter()
        .find(|c| c.unit_id == "r1/design")
        .unwrap()
        .prompt;
    assert!(arbiter_prompt.contains("draft A"));
    assert!(arbiter_prompt.contains("draft C"));
    assert_eq!(sink.events_of_type("swarm_fanout").len(), 1);
    assert_eq!(sink.events_of_type("swarm_arbitrated").len(), 1);
}

#[tokio::test]
async fn test_low_confidence_triggers_refinement_round() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.swarm.stages = vec!["design".to_string()];
    config.swarm.drones = 2;
    config.swarm.max_refinement_rounds = 1;

    let provider = Arc::new(
        ScriptedProvider::echo()
            .script(
                "r1/design",
                vec![ScriptStep::text("# Draft\n\nCONFIDENCE: 0.4\nSTATUS: needs_changes\n")],
            )
            .script(
                "r1/design/revise-1",
                vec![ScriptStep::text("# Revised\n\nCONFIDENCE: 0.85\nSTATUS: approved\n")],
            ),
    );
    let orchestrator = orchestrator(&config, provider.clone(), &dir, None);

    let run = orchestrator
        .execute(new_run(&config, "r1", "Build a cache"), &RunControl::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run
        .stage("design")
        .unwrap()
        .output
        .as_deref()
        .unwrap()
        .starts_with("# Revised"));
    assert_eq!(provider.calls_for("r1/design/critique-1"), 1);
    assert_eq!(provider.calls_for("r1/design/revise-1"), 1);
}

#[tokio::test]
async fn test_all_drones_failing_fails_the_stage() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.swarm.stages = vec!["design".to_string()];
    config.swarm.drones = 2;

    let provider = Arc::new(ScriptedProvider::echo().script_prefix(
        "r1/design/drone-",
        vec![
            ScriptStep::Fail(ProviderError::auth("revoked")),
            ScriptStep::Fail(ProviderError::auth("revoked")),
        ],
    ));
    let orchestrator = orchestrator(&config, provider.clone(), &dir, None);

    let run = orchestrator
        .execute(new_run(&config, "r1", "Build a cache"), &RunControl::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.stage("design").unwrap().failure.clone().unwrap();
    assert_eq!(failure.category, "swarm_all_drones_failed");
    assert_eq!(provider.calls_for("r1/design"), 0);
    assert_eq!(provider.calls_for("r1/plan"), 0);
}
