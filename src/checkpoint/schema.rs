//! Checkpoint document format and structural validation.
//!
//! A checkpoint is a self-describing JSON document:
//!
//! ```json
//! { "format": "blueprint-checkpoint", "version": 1,
//!   "run": { ... }, "stages": [ ... ], "checksum": "<blake3 hex>" }
//! ```
//!
//! The checksum covers the serialized `stages` array. Which top-level sections are
//! required, and which text a completed stage's output must contain, come from a
//! [`CheckpointSchema`] rather than being fixed here.

use crate::error::CheckpointError;
use crate::pipeline::{PipelineRun, RunStatus, Stage, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub const CHECKPOINT_FORMAT: &str = "blueprint-checkpoint";
pub const CHECKPOINT_VERSION: u32 = 1;

/// Validation rules applied to every loaded checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSchema {
    /// Top-level sections that must be present
    pub required_sections: Vec<String>,
    /// Stage name to markers that must appear in that stage's output once complete
    #[serde(default)]
    pub output_markers: HashMap<String, Vec<String>>,
}

impl Default for CheckpointSchema {
    fn default() -> Self {
        Self {
            required_sections: ["format", "version", "run", "stages", "checksum"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            output_markers: HashMap::new(),
        }
    }
}

/// Run fields stored next to the stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunHeader {
    id: String,
    brief: String,
    current_stage: usize,
    status: RunStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct CheckpointDocument<'a> {
    format: &'static str,
    version: u32,
    run: RunHeader,
    stages: &'a [Stage],
    checksum: String,
}

pub fn stages_checksum(stages: &[Stage]) -> Result<String, CheckpointError> {
    let bytes =
        serde_json::to_vec(stages).map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Serialize `run` into checkpoint bytes.
pub fn encode(run: &PipelineRun) -> Result<Vec<u8>, CheckpointError> {
    let document = CheckpointDocument {
        format: CHECKPOINT_FORMAT,
        version: CHECKPOINT_VERSION,
        run: RunHeader {
            id: run.id.clone(),
            brief: run.brief.clone(),
            current_stage: run.current_stage,
            status: run.status,
            created_at: run.created_at,
            updated_at: run.updated_at,
        },
        stages: &run.stages,
        checksum: stages_checksum(&run.stages)?,
    };
    serde_json::to_vec_pretty(&document).map_err(|e| CheckpointError::Serialization(e.to_string()))
}

impl CheckpointSchema {
    /// Decode and validate checkpoint bytes. Any defect is a corruption error;
    /// a partially populated run is never returned.
    pub fn decode(&self, path: &Path, bytes: &[u8]) -> Result<PipelineRun, CheckpointError> {
        let corrupt = |reason: String| CheckpointError::Corruption {
            path: path.to_path_buf(),
            reason,
        };

        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| corrupt(format!("invalid JSON: {}", e)))?;
        let Value::Object(mut document) = value else {
            return Err(corrupt("top level is not an object".to_string()));
        };
        for section in &self.required_sections {
            if !document.contains_key(section) {
                return Err(corrupt(format!("missing required section '{}'", section)));
            }
        }

        if let Some(format) = document.get("format") {
            if format.as_str() != Some(CHECKPOINT_FORMAT) {
                return Err(corrupt(format!("unexpected format tag {}", format)));
            }
        }
        if let Some(version) = document.get("version") {
            if version.as_u64() != Some(CHECKPOINT_VERSION as u64) {
                return Err(corrupt(format!("unsupported version {}", version)));
            }
        }

        let header: RunHeader = serde_json::from_value(document.remove("run").unwrap_or(Value::Null))
            .map_err(|e| corrupt(format!("malformed run section: {}", e)))?;
        let stages: Vec<Stage> =
            serde_json::from_value(document.remove("stages").unwrap_or(Value::Null))
                .map_err(|e| corrupt(format!("malformed stages section: {}", e)))?;

        if let Some(recorded) = document.get("checksum") {
            let actual = stages_checksum(&stages)?;
            if recorded.as_str() != Some(actual.as_str()) {
                return Err(corrupt(format!(
                    "checksum mismatch (recorded {}, computed {})",
                    recorded, actual
                )));
            }
        }

        let run = PipelineRun {
            id: header.id,
            brief: header.brief,
            stages,
            current_stage: header.current_stage,
            status: header.status,
            created_at: header.created_at,
            updated_at: header.updated_at,
        };
        self.check_consistency(&run).map_err(corrupt)?;
        Ok(run)
    }

    /// Status and marker checks that do not depend on the encoding.
    pub fn check_consistency(&self, run: &PipelineRun) -> Result<(), String> {
        if run.current_stage > run.stages.len() {
            return Err(format!(
                "current stage {} out of range for {} stages",
                run.current_stage,
                run.stages.len()
            ));
        }
        for stage in &run.stages {
            if stage.status.is_in_flight() {
                return Err(format!("stage '{}' was saved while {}", stage.name, stage.status));
            }
            if stage.is_complete() && stage.output.is_none() {
                return Err(format!("stage '{}' is complete but has no output", stage.name));
            }
            for record in &stage.phases {
                if record.status.is_in_flight() {
                    return Err(format!(
                        "phase {} of stage '{}' was saved while {}",
                        record.phase.number, stage.name, record.status
                    ));
                }
                if record.status == StageStatus::Complete && record.output.is_none() {
                    return Err(format!(
                        "phase {} of stage '{}' is complete but has no output",
                        record.phase.number, stage.name
                    ));
                }
            }
            if let (true, Some(markers)) = (stage.is_complete(), self.output_markers.get(&stage.name)) {
                let output = stage.output.as_deref().unwrap_or_default();
                if let Some(missing) = markers.iter().find(|m| !output.contains(m.as_str())) {
                    return Err(format!(
                        "stage '{}' output is missing marker '{}'",
                        stage.name, missing
                    ));
                }
            }
        }
        Ok(())
    }
}
