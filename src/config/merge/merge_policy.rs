//! Merge rules: defaults for keys whose section-level serde defaults would not apply.
//!
//! A section present in any source is deserialized field by field, so keys whose
//! "absent" meaning differs from the section default are seeded here.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("provider.kind", "openai_compatible")?
        .set_default("provider.api_key_env", "OPENAI_API_KEY")?
        .set_default("checkpoint.dir", ".blueprint/checkpoints")?
        .set_default("logging.file", ".blueprint/blueprint.log")
}
