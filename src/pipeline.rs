//! Pipeline model: runs, stages, phases and stage definitions.
//!
//! A [`PipelineRun`] is owned and mutated only by the orchestrator; the checkpoint
//! store persists it between stages.

pub mod phases;
pub mod prompts;

use crate::swarm::SwarmConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use phases::parse_phases;
pub use prompts::{PromptRegistry, StageContext, StagePromptBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Streaming => "streaming",
            StageStatus::Complete => "complete",
            StageStatus::Failed => "failed",
            StageStatus::Cancelled => "cancelled",
        }
    }

    /// Running or streaming: never allowed in a checkpoint.
    pub fn is_in_flight(self) -> bool {
        matches!(self, StageStatus::Running | StageStatus::Streaming)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parallelizable sub-unit of a phased stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub number: u32,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: StageStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl PhaseRecord {
    pub fn pending(phase: Phase) -> Self {
        Self {
            phase,
            status: StageStatus::Pending,
            output: None,
            attempts: 0,
        }
    }
}

/// What a failed stage reports to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Last error category, e.g. `auth` or `swarm_all_drones_failed`
    pub category: String,
    pub attempts: u32,
    pub partial_output: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub status: StageStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub failure: Option<StageFailure>,
    #[serde(default)]
    pub ensemble: bool,
}

impl Stage {
    pub fn pending(name: impl Into<String>, ensemble: bool) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            output: None,
            retry_count: 0,
            started_at: None,
            finished_at: None,
            phases: Vec::new(),
            failure: None,
            ensemble,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == StageStatus::Complete
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub brief: String,
    pub stages: Vec<Stage>,
    pub current_stage: usize,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(
        id: impl Into<String>,
        brief: impl Into<String>,
        definitions: &[StageDefinition],
        swarm: &SwarmConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            brief: brief.into(),
            stages: definitions
                .iter()
                .map(|d| Stage::pending(&d.name, swarm.is_ensemble(&d.name)))
                .collect(),
            current_stage: 0,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Index of the first stage that is not complete.
    pub fn next_pending(&self) -> Option<usize> {
        self.stages.iter().position(|s| !s.is_complete())
    }

    pub fn completed_stages(&self) -> usize {
        self.stages.iter().filter(|s| s.is_complete()).count()
    }

    /// Stage holding the run's failure, if any.
    pub fn failed_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| s.status == StageStatus::Failed)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Where a phased stage gets its phases from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSource {
    Fixed(Vec<Phase>),
    /// Parse phases out of an earlier stage's output.
    FromStage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    Single,
    Phased(PhaseSource),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    pub name: String,
    pub kind: StageKind,
}

impl StageDefinition {
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Single,
        }
    }

    pub fn phased(name: impl Into<String>, source: PhaseSource) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Phased(source),
        }
    }
}

/// One configured stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    /// Run one unit per phase parsed from this stage's output
    #[serde(default)]
    pub phases_from: Option<String>,

    /// Run one unit per listed phase
    #[serde(default)]
    pub phases: Vec<Phase>,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

fn default_stages() -> Vec<StageConfig> {
    let stage = |name: &str, phases_from: Option<&str>| StageConfig {
        name: name.to_string(),
        phases_from: phases_from.map(str::to_string),
        phases: Vec::new(),
    };
    vec![
        stage("design", None),
        stage("plan", None),
        stage("phases", Some("plan")),
        stage("handoff", None),
    ]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err("at least one stage is required".to_string());
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(format!("stage {} has an empty name", i + 1));
            }
            if self.stages[..i].iter().any(|s| s.name == stage.name) {
                return Err(format!("duplicate stage '{}'", stage.name));
            }
            if stage.phases_from.is_some() && !stage.phases.is_empty() {
                return Err(format!(
                    "stage '{}' sets both phases_from and phases",
                    stage.name
                ));
            }
            if let Some(source) = &stage.phases_from {
                if !self.stages[..i].iter().any(|s| &s.name == source) {
                    return Err(format!(
                        "stage '{}' takes phases from '{}', which does not run before it",
                        stage.name, source
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn definitions(&self) -> Vec<StageDefinition> {
        self.stages
            .iter()
            .map(|stage| match (&stage.phases_from, stage.phases.is_empty()) {
                (Some(source), _) => {
                    StageDefinition::phased(&stage.name, PhaseSource::FromStage(source.clone()))
                }
                (None, false) => {
                    StageDefinition::phased(&stage.name, PhaseSource::Fixed(stage.phases.clone()))
                }
                (None, true) => StageDefinition::single(&stage.name),
            })
            .collect()
    }
}
