//! CLI domain: parse, route, output, and presentation only.
//! No pipeline logic; a single route table dispatches to the orchestrator and checkpoint store.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::{map_error, CommandOutput};
pub use parse::{command_name, Cli, Commands};
pub use presentation::{
    format_inspect_json, format_inspect_text, format_run_summary, format_status_json,
    format_status_table, ConsolePrinter, ConsoleRenderer,
};
pub use route::RunContext;
