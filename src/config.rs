//! Configuration System
//!
//! Layered configuration for the pipeline engine: built-in defaults, then the global
//! file, then workspace files, then `BLUEPRINT__SECTION__KEY` environment overrides.
//! Each component owns its section type; this module aggregates and validates them.

use serde::{Deserialize, Serialize};
use std::fmt;

mod facade;
mod merge;
mod sources;

pub use crate::checkpoint::CheckpointConfig;
pub use crate::generation::GenerationConfig;
pub use crate::logging::LoggingConfig;
pub use crate::pipeline::{PipelineConfig, StageConfig};
pub use crate::provider::{ProviderConfig, ProviderKind};
pub use crate::retry::RetryConfig;
pub use crate::scheduler::SchedulerConfig;
pub use crate::stream::StreamConfig;
pub use crate::swarm::SwarmConfig;
pub use facade::ConfigLoader;
pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlueprintConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub swarm: SwarmConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A section failed its own checks
    Section(&'static str, String),
    /// Sections disagree with each other
    CrossReference(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Section(section, msg) => write!(f, "[{}] {}", section, msg),
            ValidationError::CrossReference(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl BlueprintConfig {
    /// Validate the entire configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let sections: [(&'static str, Result<(), String>); 9] = [
            ("scheduler", self.scheduler.validate()),
            ("retry", self.retry.validate()),
            ("stream", self.stream.validate()),
            ("swarm", self.swarm.validate()),
            ("checkpoint", self.checkpoint.validate()),
            ("generation", self.generation.validate()),
            ("provider", self.provider.validate()),
            ("pipeline", self.pipeline.validate()),
            ("logging", self.logging.validate()),
        ];
        let mut errors: Vec<ValidationError> = sections
            .into_iter()
            .filter_map(|(section, result)| {
                result.err().map(|msg| ValidationError::Section(section, msg))
            })
            .collect();

        let known = |name: &str| self.pipeline.stages.iter().any(|s| s.name == name);
        for stage in &self.swarm.stages {
            if !known(stage) {
                errors.push(ValidationError::CrossReference(format!(
                    "swarm.stages names unknown stage '{}'",
                    stage
                )));
            }
        }
        for stage in self.checkpoint.output_markers.keys() {
            if !known(stage) {
                errors.push(ValidationError::CrossReference(format!(
                    "checkpoint.output_markers names unknown stage '{}'",
                    stage
                )));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BlueprintConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.max_concurrent_units, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.pipeline.stages.len(), 4);
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let mut config = BlueprintConfig::default();
        config.scheduler.max_concurrent_units = 0;
        config.retry.max_attempts = 0;
        config.swarm.stages = vec!["review".to_string()];

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[0], ValidationError::Section("scheduler", _)));
        assert!(matches!(errors[1], ValidationError::Section("retry", _)));
        assert!(errors[2].to_string().contains("'review'"));
    }

    #[test]
    fn test_output_markers_must_name_configured_stages() {
        let mut config = BlueprintConfig::default();
        config
            .checkpoint
            .output_markers
            .insert("missing".to_string(), vec!["x".to_string()]);
        let errors = config.validate().unwrap_err();
        assert!(matches!(errors[0], ValidationError::CrossReference(_)));
    }
}
