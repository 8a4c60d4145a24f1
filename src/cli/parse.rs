//! CLI parse: clap types for Blueprint. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Blueprint CLI - staged LLM planning pipeline
#[derive(Parser)]
#[command(name = "blueprint")]
#[command(about = "Turn a project brief into design, plan, per-phase specs and a handoff")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level unless other log flags say otherwise
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, both)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new run from a brief file
    Run {
        /// Markdown or text file holding the project brief
        #[arg(long)]
        brief: PathBuf,
        /// Use the built-in echo provider instead of the configured one
        #[arg(long)]
        dry_run: bool,
        /// Hide streamed tokens; print only the summary
        #[arg(long)]
        quiet: bool,
    },
    /// Continue a paused or failed run from its last checkpoint
    Resume {
        run_id: String,
        /// Use the built-in echo provider instead of the configured one
        #[arg(long)]
        dry_run: bool,
        /// Hide streamed tokens; print only the summary
        #[arg(long)]
        quiet: bool,
    },
    /// List stored runs
    Status {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Validate a run's checkpoint and print its stage outputs
    Inspect {
        run_id: String,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// Command name string for logs and progress sessions.
pub fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Run { .. } => "run",
        Commands::Resume { .. } => "resume",
        Commands::Status { .. } => "status",
        Commands::Inspect { .. } => "inspect",
        Commands::Config => "config",
    }
}
