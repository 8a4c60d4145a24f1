//! CLI presentation: console token rendering and text/json formatters per command.

mod console;
mod runs;

pub use console::{ConsolePrinter, ConsoleRenderer};
pub use runs::{
    format_inspect_json, format_inspect_text, format_run_summary, format_status_json,
    format_status_table,
};
