//! Shared test utilities for integration tests
//!
//! Fast retry settings, orchestrator construction, and serialized access to the
//! process environment for config tests.

use blueprint::checkpoint::{CheckpointSchema, CheckpointStore};
use blueprint::config::BlueprintConfig;
use blueprint::orchestrator::Orchestrator;
use blueprint::pipeline::{PipelineRun, PromptRegistry};
use blueprint::provider::ScriptedProvider;
use blueprint::telemetry::EventContext;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Serializes tests that touch BLUEPRINT_* and XDG environment variables.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Run `f` with the given variables set, restoring the previous values afterwards.
pub fn with_env<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let saved: Vec<(String, Option<String>)> = vars
        .iter()
        .map(|(k, _)| (k.to_string(), std::env::var(k).ok()))
        .collect();
    for (key, value) in vars {
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
    }
    let result = f();
    for (key, value) in saved {
        match value {
            Some(v) => std::env::set_var(&key, v),
            None => std::env::remove_var(&key),
        }
    }
    result
}

/// Defaults with near-zero backoff and a fixed jitter seed.
pub fn fast_config() -> BlueprintConfig {
    let mut config = BlueprintConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 4;
    config.retry.seed = Some(42);
    config.swarm.seed = Some(42);
    config
}

pub fn orchestrator(
    config: &BlueprintConfig,
    provider: Arc<ScriptedProvider>,
    dir: &TempDir,
    events: Option<EventContext>,
) -> Orchestrator {
    let store = CheckpointStore::new(dir.path(), CheckpointSchema::default()).unwrap();
    Orchestrator::new(config, provider, store, PromptRegistry::default(), events).unwrap()
}

pub fn new_run(config: &BlueprintConfig, id: &str, brief: &str) -> PipelineRun {
    PipelineRun::new(id, brief, &config.pipeline.definitions(), &config.swarm)
}
