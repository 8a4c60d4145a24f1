//! CLI output: command results and error mapping to a stable CLI surface.

use crate::error::{CheckpointError, PipelineError};
use crate::pipeline::RunStatus;

/// Rendered command result plus the process exit code it implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(text: String) -> Self {
        Self { text, exit_code: 0 }
    }

    /// Paused runs exit like an interrupted process; failed runs exit 1.
    pub fn for_run(text: String, status: RunStatus) -> Self {
        let exit_code = match status {
            RunStatus::Completed => 0,
            RunStatus::Paused => 130,
            RunStatus::Pending | RunStatus::Running | RunStatus::Failed => 1,
        };
        Self { text, exit_code }
    }
}

/// Map domain errors to a string for CLI output.
pub fn map_error(e: &PipelineError) -> String {
    match e {
        PipelineError::CheckpointError(CheckpointError::NotFound(run_id)) => {
            format!("No run named '{}'. Use `blueprint status` to list runs.", run_id)
        }
        PipelineError::RunFinished(run_id) => {
            format!("Run {} already completed; nothing to resume.", run_id)
        }
        other => other.to_string(),
    }
}
