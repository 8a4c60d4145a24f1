//! Blueprint CLI Binary
//!
//! Command-line interface for the staged planning pipeline.

use anyhow::Context;
use blueprint::cli::{map_error, Cli, RunContext};
use blueprint::config::ConfigLoader;
use blueprint::logging::{init_logging, LoggingConfig};
use clap::Parser;
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Blueprint CLI starting");

    let runtime = match tokio::runtime::Runtime::new().context("failed to start tokio runtime") {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        let context = match RunContext::new(cli.workspace.clone(), cli.config.clone()) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("Error initializing workspace: {}", e);
                eprintln!("{}", map_error(&e));
                return 1;
            }
        };
        match context.execute(&cli.command).await {
            Ok(output) => {
                info!(exit_code = output.exit_code, "Command completed");
                println!("{}", output.text);
                output.exit_code
            }
            Err(e) => {
                error!("Command failed: {}", e);
                eprintln!("{}", map_error(&e));
                1
            }
        }
    });
    drop(runtime);
    process::exit(code);
}

/// Build logging configuration from CLI args, environment, and config file.
///
/// Logs go to the workspace log file by default so stdout stays free for streamed tokens;
/// `--verbose` switches to debug output on stderr.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = if let Some(ref config_path) = cli.config {
        ConfigLoader::load_from_file(config_path)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default()
    } else {
        ConfigLoader::load(&cli.workspace)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default()
    };

    if cli.verbose {
        config.level = "debug".to_string();
        config.output = "stderr".to_string();
    }

    // CLI arguments have the highest priority
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.file = file.clone();
    }
    config.resolve_file(&cli.workspace);
    config
}
