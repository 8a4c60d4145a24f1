//! CLI route: single route table and run context. Dispatches to domain services and presentation.

use crate::checkpoint::CheckpointStore;
use crate::cli::output::CommandOutput;
use crate::cli::parse::{command_name, Commands};
use crate::cli::presentation::{
    format_inspect_json, format_inspect_text, format_run_summary, format_status_json,
    format_status_table, ConsoleRenderer,
};
use crate::config::{BlueprintConfig, ConfigLoader};
use crate::error::{CheckpointError, PipelineError};
use crate::orchestrator::{Orchestrator, RunControl};
use crate::pipeline::{PipelineRun, PromptRegistry};
use crate::provider::{GenerationProvider, ProviderFactory, ScriptedProvider};
use crate::telemetry::{new_session_id, EventContext, JsonlSink, ProgressRuntime, ProgressSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const PROGRESS_LOG: &str = "progress.jsonl";
const RENDER_GRACE: Duration = Duration::from_secs(2);

/// One orchestrated run or resume plus its console and interrupt plumbing.
struct Session {
    orchestrator: Orchestrator,
    control: RunControl,
    renderer: Option<ConsoleRenderer>,
    interrupt: JoinHandle<()>,
}

impl Session {
    /// Tear down in order: stop listening for Ctrl-C, close the hub, drain the console.
    async fn close(self, result: Result<PipelineRun, PipelineError>) -> Result<PipelineRun, PipelineError> {
        self.interrupt.abort();
        drop(self.orchestrator);
        if let Some(renderer) = self.renderer {
            renderer.finish(RENDER_GRACE).await;
        }
        result
    }
}

/// Runtime context for CLI execution: workspace, loaded configuration and checkpoint location.
pub struct RunContext {
    workspace_root: PathBuf,
    config: BlueprintConfig,
    checkpoint_dir: PathBuf,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, PipelineError> {
        let config = match &config_path {
            Some(path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        config.validate().map_err(|errors| {
            let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
            PipelineError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                lines.join("\n")
            ))
        })?;
        let checkpoint_dir = config.checkpoint.resolve_dir(&workspace_root);
        Ok(Self {
            workspace_root,
            config,
            checkpoint_dir,
        })
    }

    pub fn config(&self) -> &BlueprintConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn store(&self) -> Result<CheckpointStore, PipelineError> {
        Ok(CheckpointStore::new(
            &self.checkpoint_dir,
            self.config.checkpoint.schema(),
        )?)
    }

    /// Execute a CLI command via the single route table.
    pub async fn execute(&self, command: &Commands) -> Result<CommandOutput, PipelineError> {
        let started = Instant::now();
        let result = match command {
            Commands::Run {
                brief,
                dry_run,
                quiet,
            } => self.handle_run(brief, *dry_run, *quiet).await,
            Commands::Resume {
                run_id,
                dry_run,
                quiet,
            } => self.handle_resume(run_id, *dry_run, *quiet).await,
            Commands::Status { format } => self.handle_status(format),
            Commands::Inspect { run_id, format } => self.handle_inspect(run_id, format),
            Commands::Config => self.handle_config(),
        };
        info!(
            command = command_name(command),
            ok = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        result
    }

    async fn handle_run(
        &self,
        brief_path: &Path,
        dry_run: bool,
        quiet: bool,
    ) -> Result<CommandOutput, PipelineError> {
        let path = if brief_path.is_absolute() {
            brief_path.to_path_buf()
        } else {
            self.workspace_root.join(brief_path)
        };
        let brief = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::InvalidRun(format!("Cannot read brief {}: {}", path.display(), e))
        })?;
        if brief.trim().is_empty() {
            return Err(PipelineError::InvalidRun(format!(
                "Brief {} is empty",
                path.display()
            )));
        }
        let session = self.open_session(dry_run, quiet)?;
        let result = session.orchestrator.start(&brief, &session.control).await;
        let run = session.close(result).await?;
        Ok(CommandOutput::for_run(format_run_summary(&run), run.status))
    }

    async fn handle_resume(
        &self,
        run_id: &str,
        dry_run: bool,
        quiet: bool,
    ) -> Result<CommandOutput, PipelineError> {
        let session = self.open_session(dry_run, quiet)?;
        let result = session.orchestrator.resume(run_id, &session.control).await;
        let run = session.close(result).await?;
        Ok(CommandOutput::for_run(format_run_summary(&run), run.status))
    }

    /// Build an orchestrator with the console renderer and Ctrl-C handling attached.
    fn open_session(&self, dry_run: bool, quiet: bool) -> Result<Session, PipelineError> {
        let provider: Arc<dyn GenerationProvider> = if dry_run {
            Arc::new(ScriptedProvider::echo())
        } else {
            ProviderFactory::create(&self.config.provider)?
        };
        let store = self.store()?;
        let sink = JsonlSink::open(store.dir().join(PROGRESS_LOG)).map_err(CheckpointError::from)?;
        let sinks: Vec<Arc<dyn ProgressSink>> = vec![Arc::new(sink)];
        let events = EventContext::new(new_session_id(), ProgressRuntime::new(sinks));
        info!(
            session_id = %events.session_id,
            provider = provider.provider_name(),
            dry_run,
            "Starting pipeline session"
        );

        let orchestrator = Orchestrator::new(
            &self.config,
            provider,
            store,
            PromptRegistry::default(),
            Some(events),
        )?;
        let renderer = (!quiet).then(|| ConsoleRenderer::spawn(orchestrator.hub(), true));

        let control = RunControl::new();
        let interrupt = {
            let control = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    eprintln!("\nInterrupted; stopping in-flight units...");
                    control.cancel_run();
                }
            })
        };

        Ok(Session {
            orchestrator,
            control,
            renderer,
            interrupt,
        })
    }

    fn handle_status(&self, format: &str) -> Result<CommandOutput, PipelineError> {
        let runs = self.store()?.list()?;
        let text = match format {
            "json" => format_status_json(&runs)?,
            _ => format_status_table(&runs),
        };
        Ok(CommandOutput::ok(text))
    }

    fn handle_inspect(&self, run_id: &str, format: &str) -> Result<CommandOutput, PipelineError> {
        let store = self.store()?;
        let run = store.load(run_id)?;
        let text = match format {
            "json" => format_inspect_json(&run)?,
            _ => format_inspect_text(&run),
        };
        Ok(CommandOutput::ok(text))
    }

    fn handle_config(&self) -> Result<CommandOutput, PipelineError> {
        let text = toml::to_string_pretty(&self.config)
            .map_err(|e| PipelineError::ConfigError(e.to_string()))?;
        Ok(CommandOutput::ok(text))
    }
}
