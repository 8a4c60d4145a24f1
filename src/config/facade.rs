//! Config loader facade: assembles sources in precedence order and deserializes.

use crate::config::merge::merge_policy;
use crate::config::sources::{environment, global_file, workspace_file};
use crate::config::BlueprintConfig;
use config::{ConfigError, File, FileFormat};
use std::path::Path;
use tracing::debug;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace.
    ///
    /// Precedence (lowest to highest): defaults, global file, workspace files,
    /// environment.
    pub fn load(workspace_root: &Path) -> Result<BlueprintConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = environment::add_to_builder(builder);
        let config: BlueprintConfig = builder.build()?.try_deserialize()?;
        debug!(workspace = %workspace_root.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load a single TOML file on top of the defaults, ignoring other sources.
    pub fn load_from_file(path: &Path) -> Result<BlueprintConfig, ConfigError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| ConfigError::Message(format!("non UTF-8 config path: {:?}", path)))?;
        let config: BlueprintConfig = merge_policy::builder_with_defaults()?
            .add_source(File::new(path_str, FileFormat::Toml).required(true))
            .build()?
            .try_deserialize()?;
        debug!(path = %path.display(), "Configuration loaded from file");
        Ok(config)
    }
}
