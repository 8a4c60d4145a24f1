//! Integration tests for the layered configuration loader

use super::test_utils::with_env;
use blueprint::config::{global_config_path, BlueprintConfig, ConfigLoader, ProviderKind};
use tempfile::TempDir;

fn write(path: &std::path::Path, text: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, text).unwrap();
}

#[test]
fn test_sources_layer_global_workspace_env() {
    let xdg = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    write(
        &xdg.path().join("blueprint/config.toml"),
        r#"
[scheduler]
max_concurrent_units = 2

[retry]
max_attempts = 6

[provider]
kind = "ollama"
endpoint = "http://localhost:11434"
"#,
    );
    write(
        &workspace.path().join(".blueprint/config.toml"),
        r#"
[scheduler]
max_concurrent_units = 3

[generation]
model = "llama3"
"#,
    );
    write(
        &workspace.path().join(".blueprint/ci.toml"),
        r#"
[retry]
max_attempts = 2
"#,
    );

    let xdg_path = xdg.path().to_str().unwrap().to_string();
    with_env(
        &[
            ("XDG_CONFIG_HOME", Some(xdg_path.as_str())),
            ("BLUEPRINT_ENV", Some("ci")),
            ("BLUEPRINT__SCHEDULER__MAX_CONCURRENT_UNITS", None),
            ("BLUEPRINT__SWARM__STAGES", None),
        ],
        || {
            assert_eq!(
                global_config_path().unwrap(),
                xdg.path().join("blueprint/config.toml")
            );
            let config = ConfigLoader::load(workspace.path()).unwrap();
            assert_eq!(config.scheduler.max_concurrent_units, 3);
            assert_eq!(config.retry.max_attempts, 2);
            assert_eq!(config.provider.kind, ProviderKind::Ollama);
            assert_eq!(config.generation.model, "llama3");
            assert!(config.validate().is_ok());
        },
    );

    with_env(
        &[
            ("XDG_CONFIG_HOME", Some(xdg_path.as_str())),
            ("BLUEPRINT_ENV", None),
            ("BLUEPRINT__SCHEDULER__MAX_CONCURRENT_UNITS", Some("9")),
            ("BLUEPRINT__SWARM__STAGES", Some("design,handoff")),
        ],
        || {
            let config = ConfigLoader::load(workspace.path()).unwrap();
            assert_eq!(config.scheduler.max_concurrent_units, 9);
            assert_eq!(config.retry.max_attempts, 6);
            assert_eq!(config.swarm.stages, vec!["design", "handoff"]);
            assert!(config.validate().is_ok());
        },
    );
}

#[test]
fn test_unknown_ensemble_stage_fails_validation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blueprint.toml");
    write(
        &path,
        r#"
[swarm]
stages = ["review"]
drones = 0
"#,
    );
    let config = ConfigLoader::load_from_file(&path).unwrap();
    let errors = config.validate().unwrap_err();
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    assert!(messages.iter().any(|m| m.contains("unknown stage 'review'")));
    assert!(messages.iter().any(|m| m.starts_with("[swarm]")));
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(ConfigLoader::load_from_file(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_effective_config_round_trips_through_toml() {
    let config = BlueprintConfig::default();
    let text = toml::to_string_pretty(&config).unwrap();
    let parsed: BlueprintConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed.pipeline.stages.len(), config.pipeline.stages.len());
    assert_eq!(parsed.checkpoint.dir, config.checkpoint.dir);
}
