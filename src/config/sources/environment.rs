//! Environment source: BLUEPRINT__SECTION__KEY overrides.

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment};

pub const ENV_PREFIX: &str = "BLUEPRINT";

/// Add environment overrides, e.g. `BLUEPRINT__SCHEDULER__MAX_CONCURRENT_UNITS=8`.
/// `BLUEPRINT__SWARM__STAGES` takes a comma-separated list.
pub fn add_to_builder(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("swarm.stages"),
    )
}
