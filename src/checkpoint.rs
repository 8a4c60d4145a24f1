//! Checkpoint domain: document schema and the file-backed store.
//!
//! Checkpoints are written only at stage boundaries, so a resumed run always
//! restarts at the next pending stage.

pub mod schema;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use schema::{CheckpointSchema, CHECKPOINT_FORMAT, CHECKPOINT_VERSION};
pub use store::{CheckpointStore, Recovery, RunSummary};

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding checkpoints, relative to the workspace unless absolute
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Overrides the default required section set
    #[serde(default)]
    pub required_sections: Option<Vec<String>>,

    /// Stage name to text its completed output must contain
    #[serde(default)]
    pub output_markers: HashMap<String, Vec<String>>,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".blueprint/checkpoints")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            required_sections: None,
            output_markers: HashMap::new(),
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.dir.as_os_str().is_empty() {
            return Err("Checkpoint dir cannot be empty".to_string());
        }
        if let Some(sections) = &self.required_sections {
            if sections.iter().any(|s| s.trim().is_empty()) {
                return Err("required_sections cannot contain empty names".to_string());
            }
        }
        Ok(())
    }

    pub fn schema(&self) -> CheckpointSchema {
        let mut schema = CheckpointSchema::default();
        if let Some(sections) = &self.required_sections {
            schema.required_sections = sections.clone();
        }
        schema.output_markers = self.output_markers.clone();
        schema
    }

    pub fn resolve_dir(&self, workspace_root: &Path) -> PathBuf {
        if self.dir.is_absolute() {
            self.dir.clone()
        } else {
            workspace_root.join(&self.dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_follows_configuration() {
        let mut config = CheckpointConfig::default();
        assert_eq!(config.schema(), CheckpointSchema::default());

        config.required_sections = Some(vec!["run".to_string(), "stages".to_string()]);
        config
            .output_markers
            .insert("plan".to_string(), vec!["## Phase".to_string()]);
        let schema = config.schema();
        assert_eq!(schema.required_sections, vec!["run", "stages"]);
        assert_eq!(schema.output_markers["plan"], vec!["## Phase"]);
    }

    #[test]
    fn relative_dir_resolves_under_workspace() {
        let config = CheckpointConfig::default();
        assert_eq!(
            config.resolve_dir(Path::new("/ws")),
            PathBuf::from("/ws/.blueprint/checkpoints")
        );
    }
}
