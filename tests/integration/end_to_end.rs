//! End-to-end pipeline run with a phased stage under a concurrency budget of two

use super::test_utils::orchestrator;
use blueprint::config::ConfigLoader;
use blueprint::orchestrator::RunControl;
use blueprint::pipeline::{PipelineRun, RunStatus, StageStatus};
use blueprint::provider::ScriptedProvider;
use blueprint::stream::Terminal;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CONFIG: &str = r#"
[scheduler]
max_concurrent_units = 2

[retry]
base_delay_ms = 1
max_delay_ms = 2
seed = 5

[[pipeline.stages]]
name = "design"

[[pipeline.stages]]
name = "plan"

[[pipeline.stages.phases]]
number = 1
title = "Storage"
content = "Pick the storage engine."

[[pipeline.stages.phases]]
number = 2
title = "API"
content = "Define the request surface."
acceptance_criteria = ["Every endpoint documented"]

[[pipeline.stages.phases]]
number = 3
title = "Rollout"
content = "Plan the deployment."

[[pipeline.stages]]
name = "handoff"
"#;

#[tokio::test]
async fn test_phased_stage_runs_under_budget_and_checkpoints_every_phase() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("blueprint.toml");
    std::fs::write(&config_path, CONFIG).unwrap();
    let config = ConfigLoader::load_from_file(&config_path).unwrap();
    assert!(config.validate().is_ok());

    let provider =
        Arc::new(ScriptedProvider::echo().with_token_delay(Duration::from_millis(2)));
    let orchestrator = orchestrator(&config, provider.clone(), &dir, None);
    let mut tap = orchestrator.hub().tap();

    let run = PipelineRun::new(
        "r1",
        "Build a document store",
        &config.pipeline.definitions(),
        &config.swarm,
    );
    let run = orchestrator.execute(run, &RunControl::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(provider.max_in_flight(), 2);

    let stored = orchestrator.store().load("r1").unwrap();
    let plan = stored.stage("plan").unwrap();
    assert_eq!(plan.phases.len(), 3);
    assert!(plan
        .phases
        .iter()
        .all(|p| p.status == StageStatus::Complete && p.output.is_some()));
    let output = plan.output.as_deref().unwrap();
    let positions: Vec<usize> = ["## Phase 1: Storage", "## Phase 2: API", "## Phase 3: Rollout"]
        .iter()
        .map(|header| output.find(header).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    let calls: Vec<String> = provider.calls().into_iter().map(|c| c.unit_id).collect();
    let handoff = calls.iter().position(|id| id == "r1/handoff").unwrap();
    for phase in 1..=3 {
        let id = format!("r1/plan/phase-{}", phase);
        assert!(calls.iter().position(|c| *c == id).unwrap() < handoff);
    }
    let handoff_prompt = &provider.calls()[handoff].prompt;
    assert!(handoff_prompt.contains("Rollout"));

    let mut streamed = Vec::new();
    while let Ok(subscription) = tap.try_recv() {
        let unit_id = subscription.unit_id().to_string();
        let (text, terminal) = subscription.collect_text().await;
        assert_eq!(terminal, Some(Terminal::Ok));
        assert!(!text.is_empty());
        streamed.push(unit_id);
    }
    streamed.sort();
    assert_eq!(
        streamed,
        vec![
            "r1/design",
            "r1/handoff",
            "r1/plan/phase-1",
            "r1/plan/phase-2",
            "r1/plan/phase-3",
        ]
    );
}
