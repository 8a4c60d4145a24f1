//! Workspace config file source: .blueprint/config.toml and .blueprint/{env}.toml

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::{File, FileFormat};
use std::path::Path;

/// Add workspace config files to builder.
/// Precedence: .blueprint/config.toml (base) then .blueprint/{BLUEPRINT_ENV}.toml (env-specific).
pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let config_dir = workspace_root.join(".blueprint");
    let env_name = std::env::var("BLUEPRINT_ENV").unwrap_or_else(|_| "development".to_string());

    let mut builder = builder;
    for path in [
        config_dir.join("config.toml"),
        config_dir.join(format!("{}.toml", env_name)),
    ] {
        if !path.exists() {
            continue;
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| ConfigError::Message(format!("non UTF-8 config path: {:?}", path)))?;
        builder = builder.add_source(File::new(path_str, FileFormat::Toml).required(false));
    }
    Ok(builder)
}
