//! Orchestrator: runs a pipeline's stages in order.
//!
//! Single stages submit one unit (or one swarm request when the stage is flagged
//! for ensemble mode). Phased stages submit every phase up front, let the scheduler
//! bound how many run at once, and wait for all of them before assembling the stage
//! output in phase-number order. The run is checkpointed after every stage that
//! completes or fails; a cancelled stage keeps the last stage-boundary checkpoint and
//! only marks it paused.

use crate::cancel::CancelToken;
use crate::checkpoint::{CheckpointStore, Recovery};
use crate::config::BlueprintConfig;
use crate::error::{CheckpointError, PipelineError, UnitError};
use crate::generation::{
    GenerationConfig, GenerationEngine, GenerationRequest, UnitOutput, UnitOwner,
};
use crate::pipeline::{
    parse_phases, Phase, PhaseRecord, PhaseSource, PipelineRun, PromptRegistry, RunStatus,
    StageContext, StageDefinition, StageFailure, StageKind, StageStatus,
};
use crate::provider::{ChatMessage, GenerationProvider};
use crate::retry::RetryPolicy;
use crate::scheduler::TaskScheduler;
use crate::stream::StreamHub;
use crate::swarm::{ArbiterSynthesis, SwarmConfig, SwarmCoordinator};
use crate::telemetry::{emit_optional, new_run_id, EventContext, StageEventData};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cancellation handle for one run.
///
/// Cancelling the run cancels the live stage and every unit under it. Cancelling
/// the stage cancels only that stage's units. Either way the run ends paused.
#[derive(Clone, Default)]
pub struct RunControl {
    run: CancelToken,
    stage: Arc<Mutex<Option<CancelToken>>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_run(&self) {
        self.run.cancel();
    }

    /// Cancel the live stage. Returns false when no stage is running.
    pub fn cancel_stage(&self) -> bool {
        match self.stage.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_run_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }

    fn begin_stage(&self) -> CancelToken {
        let token = self.run.child();
        *self.stage.lock() = Some(token.clone());
        token
    }

    fn end_stage(&self) {
        self.stage.lock().take();
    }
}

/// Text and attempt count of one finished unit or swarm request.
struct UnitOutcome {
    text: String,
    attempts: u32,
}

impl From<UnitOutput> for UnitOutcome {
    fn from(output: UnitOutput) -> Self {
        Self {
            text: output.text,
            attempts: output.attempts,
        }
    }
}

impl From<ArbiterSynthesis> for UnitOutcome {
    fn from(synthesis: ArbiterSynthesis) -> Self {
        Self {
            text: synthesis.text,
            attempts: synthesis.rounds + 1,
        }
    }
}

pub struct Orchestrator {
    definitions: Vec<StageDefinition>,
    generation: GenerationConfig,
    swarm_config: SwarmConfig,
    engine: GenerationEngine,
    swarm: SwarmCoordinator,
    store: CheckpointStore,
    prompts: PromptRegistry,
    events: Option<EventContext>,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime; the scheduler spawns its dispatcher.
    pub fn new(
        config: &BlueprintConfig,
        provider: Arc<dyn GenerationProvider>,
        store: CheckpointStore,
        prompts: PromptRegistry,
        events: Option<EventContext>,
    ) -> Result<Self, PipelineError> {
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            PipelineError::ConfigError(messages.join("; "))
        })?;

        let scheduler = TaskScheduler::new(&config.scheduler, events.clone());
        let retry = Arc::new(RetryPolicy::new(config.retry.clone()));
        let hub = StreamHub::new(&config.stream);
        let engine = GenerationEngine::new(provider, scheduler, retry, hub, events.clone());
        let swarm = SwarmCoordinator::new(engine.clone(), config.swarm.clone());

        Ok(Self {
            definitions: config.pipeline.definitions(),
            generation: config.generation.clone(),
            swarm_config: config.swarm.clone(),
            engine,
            swarm,
            store,
            prompts,
            events,
        })
    }

    pub fn hub(&self) -> &StreamHub {
        self.engine.hub()
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        self.engine.scheduler()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn definitions(&self) -> &[StageDefinition] {
        &self.definitions
    }

    /// New pending run for `brief`, checkpointed before any stage runs.
    pub fn create_run(&self, brief: &str) -> Result<PipelineRun, PipelineError> {
        let run = PipelineRun::new(new_run_id(), brief, &self.definitions, &self.swarm_config);
        self.store.save(&run)?;
        info!(run_id = %run.id, stages = run.stages.len(), "Run created");
        Ok(run)
    }

    pub async fn start(
        &self,
        brief: &str,
        control: &RunControl,
    ) -> Result<PipelineRun, PipelineError> {
        let run = self.create_run(brief)?;
        self.execute(run, control).await
    }

    /// Continue a stored run at its first stage that is not complete.
    pub async fn resume(
        &self,
        run_id: &str,
        control: &RunControl,
    ) -> Result<PipelineRun, PipelineError> {
        let run = match self.store.recover(run_id)? {
            Recovery::Primary(run) => run,
            Recovery::Backup { run, primary_error } => {
                warn!(run_id, error = %primary_error, "Resuming from backup checkpoint");
                run
            }
            Recovery::Fresh { reason } => {
                return Err(PipelineError::InvalidRun(format!(
                    "no usable checkpoint for run {}: {}",
                    run_id, reason
                )))
            }
        };
        if run.status == RunStatus::Completed {
            return Err(PipelineError::RunFinished(run.id));
        }
        let run = prepare_resume(run);
        info!(
            run_id = %run.id,
            completed = run.completed_stages(),
            total = run.stages.len(),
            "Resuming run"
        );
        self.execute(run, control).await
    }

    /// Run every stage that is not complete, in order.
    pub async fn execute(
        &self,
        mut run: PipelineRun,
        control: &RunControl,
    ) -> Result<PipelineRun, PipelineError> {
        self.check_layout(&run)?;
        if run.status == RunStatus::Completed {
            return Err(PipelineError::RunFinished(run.id));
        }

        run.status = RunStatus::Running;
        run.touch();
        self.emit_run("run_started", &run);

        while let Some(index) = run.next_pending() {
            if control.is_run_cancelled() {
                return self.pause(run);
            }

            let stage_cancel = control.begin_stage();
            run.current_stage = index;
            {
                let stage = &mut run.stages[index];
                stage.status = StageStatus::Running;
                stage.started_at = Some(Utc::now());
                stage.finished_at = None;
                stage.failure = None;
            }
            run.touch();
            info!(run_id = %run.id, stage = %run.stages[index].name, index, "Stage started");
            self.emit_stage("stage_started", &run, index, None);

            let outcome = self.run_stage(&mut run, index, &stage_cancel).await;
            control.end_stage();

            let stage = &mut run.stages[index];
            stage.finished_at = Some(Utc::now());
            match outcome {
                Ok(output) => {
                    stage.status = StageStatus::Complete;
                    stage.output = Some(output);
                    run.current_stage = index + 1;
                    run.touch();
                    self.store.save(&run)?;
                    info!(run_id = %run.id, stage = %run.stages[index].name, "Stage complete");
                    self.emit_stage("stage_completed", &run, index, None);
                }
                Err(err) if err.is_cancelled() => {
                    stage.status = StageStatus::Cancelled;
                    info!(run_id = %run.id, stage = %stage.name, "Stage cancelled");
                    self.emit_stage("stage_cancelled", &run, index, None);
                    return self.pause(run);
                }
                Err(err) => {
                    stage.status = StageStatus::Failed;
                    stage.failure = Some(failure_report(&err));
                    run.status = RunStatus::Failed;
                    run.touch();
                    self.store.save(&run)?;
                    warn!(
                        run_id = %run.id,
                        stage = %run.stages[index].name,
                        error = %err,
                        "Stage failed"
                    );
                    self.emit_stage("stage_failed", &run, index, Some(err.to_string()));
                    self.emit_run("run_failed", &run);
                    return Ok(run);
                }
            }
        }

        run.status = RunStatus::Completed;
        run.touch();
        self.store.save(&run)?;
        info!(run_id = %run.id, "Run completed");
        self.emit_run("run_completed", &run);
        Ok(run)
    }

    fn check_layout(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        let expected = self.definitions.iter().map(|d| d.name.as_str());
        let actual = run.stages.iter().map(|s| s.name.as_str());
        if !expected.eq(actual) {
            return Err(PipelineError::InvalidRun(format!(
                "run {} has stages [{}], configured pipeline has [{}]",
                run.id,
                run.stages
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                self.definitions
                    .iter()
                    .map(|d| d.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(())
    }

    /// The in-memory run may hold a cancelled stage, so the stored copy is marked instead.
    fn pause(&self, mut run: PipelineRun) -> Result<PipelineRun, PipelineError> {
        run.status = RunStatus::Paused;
        run.touch();
        match self.store.load(&run.id) {
            Ok(mut stored) => {
                stored.status = RunStatus::Paused;
                stored.updated_at = run.updated_at;
                self.store.save(&stored)?;
            }
            Err(CheckpointError::NotFound(_)) => {}
            Err(err) => warn!(run_id = %run.id, error = %err, "Could not mark checkpoint paused"),
        }
        info!(run_id = %run.id, "Run paused");
        self.emit_run("run_paused", &run);
        Ok(run)
    }

    async fn run_stage(
        &self,
        run: &mut PipelineRun,
        index: usize,
        cancel: &CancelToken,
    ) -> Result<String, UnitError> {
        match &self.definitions[index].kind {
            StageKind::Single => self.run_single(run, index, cancel).await,
            StageKind::Phased(source) => self.run_phased(run, index, source, cancel).await,
        }
    }

    async fn run_single(
        &self,
        run: &mut PipelineRun,
        index: usize,
        cancel: &CancelToken,
    ) -> Result<String, UnitError> {
        let name = run.stages[index].name.clone();
        let ensemble = run.stages[index].ensemble;
        let messages = self.prompts.build(&StageContext {
            run: &*run,
            stage: &name,
            phase: None,
        });
        let request = self.request(&run.id, &name, None, messages, cancel.child());
        let unit = self.dispatch(request, ensemble);
        run.stages[index].status = StageStatus::Streaming;
        Ok(unit.await?.text)
    }

    async fn run_phased(
        &self,
        run: &mut PipelineRun,
        index: usize,
        source: &PhaseSource,
        cancel: &CancelToken,
    ) -> Result<String, UnitError> {
        let name = run.stages[index].name.clone();
        let phases = match source {
            PhaseSource::Fixed(phases) => phases.clone(),
            PhaseSource::FromStage(from) => {
                let text = run
                    .stage(from)
                    .filter(|s| s.is_complete())
                    .and_then(|s| s.output.as_deref())
                    .ok_or_else(|| {
                        UnitError::Aborted(format!("stage '{}' has no output to take phases from", from))
                    })?;
                parse_phases(text)
            }
        };
        if phases.is_empty() {
            return Err(UnitError::Aborted(format!(
                "stage '{}' has no phases to run",
                name
            )));
        }

        let stage = &mut run.stages[index];
        let ensemble = stage.ensemble;
        let reusable = stage.phases.len() == phases.len()
            && stage.phases.iter().zip(&phases).all(|(r, p)| r.phase == *p);
        if !reusable {
            stage.phases = phases.into_iter().map(PhaseRecord::pending).collect();
        }
        let pending: Vec<(usize, Phase)> = stage
            .phases
            .iter()
            .enumerate()
            .filter(|(_, r)| !(r.status == StageStatus::Complete && r.output.is_some()))
            .map(|(slot, r)| (slot, r.phase.clone()))
            .collect();
        let reused = stage.phases.len() - pending.len();
        if reused > 0 {
            info!(run_id = %run.id, stage = %name, reused, "Reusing completed phases");
        }

        let mut units = FuturesUnordered::new();
        for (slot, phase) in &pending {
            let messages = self.prompts.build(&StageContext {
                run: &*run,
                stage: &name,
                phase: Some(phase),
            });
            let request =
                self.request(&run.id, &name, Some(phase.number), messages, cancel.child());
            let unit = self.dispatch(request, ensemble);
            let slot = *slot;
            units.push(async move { (slot, unit.await) });

            let record = &mut run.stages[index].phases[slot];
            record.status = StageStatus::Running;
            record.output = None;
        }
        run.stages[index].status = StageStatus::Streaming;
        debug!(run_id = %run.id, stage = %name, submitted = pending.len(), "Phases submitted");

        let mut failures: Vec<(u32, UnitError)> = Vec::new();
        while let Some((slot, result)) = units.next().await {
            let record = &mut run.stages[index].phases[slot];
            match result {
                Ok(outcome) => {
                    record.status = StageStatus::Complete;
                    record.output = Some(outcome.text);
                    record.attempts = outcome.attempts;
                    debug!(stage = %name, phase = record.phase.number, "Phase complete");
                }
                Err(err) => {
                    record.attempts = err.attempts();
                    record.status = if err.is_cancelled() {
                        StageStatus::Cancelled
                    } else {
                        StageStatus::Failed
                    };
                    warn!(stage = %name, phase = record.phase.number, error = %err, "Phase did not complete");
                    failures.push((record.phase.number, err));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(UnitError::Cancelled {
                attempts: 0,
                partial_output: String::new(),
            });
        }
        if let Some((_, err)) = failures
            .into_iter()
            .min_by_key(|(number, err)| (err.is_cancelled(), *number))
        {
            return Err(err);
        }

        let mut records: Vec<&PhaseRecord> = run.stages[index].phases.iter().collect();
        records.sort_by_key(|r| r.phase.number);
        Ok(records
            .iter()
            .map(|r| {
                format!(
                    "## Phase {}: {}\n\n{}",
                    r.phase.number,
                    r.phase.title,
                    r.output.as_deref().unwrap_or_default().trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    fn request(
        &self,
        run_id: &str,
        stage: &str,
        phase: Option<u32>,
        messages: Vec<ChatMessage>,
        cancel: CancelToken,
    ) -> GenerationRequest {
        let unit_id = match phase {
            Some(number) => format!("{}/{}/phase-{}", run_id, stage, number),
            None => format!("{}/{}", run_id, stage),
        };
        GenerationRequest {
            params: self.generation.params(&unit_id),
            unit_id,
            owner: UnitOwner {
                stage: stage.to_string(),
                phase,
            },
            messages,
            cancel,
        }
    }

    /// Plain units are queued immediately so phases keep submission order.
    fn dispatch(
        &self,
        request: GenerationRequest,
        ensemble: bool,
    ) -> BoxFuture<'_, Result<UnitOutcome, UnitError>> {
        if ensemble {
            self.swarm
                .run(request)
                .map(|result| result.map(UnitOutcome::from))
                .boxed()
        } else {
            let handle = self.engine.submit(request);
            async move { handle.join().await.map(UnitOutcome::from) }.boxed()
        }
    }

    fn emit_stage(&self, event_type: &str, run: &PipelineRun, index: usize, error: Option<String>) {
        let stage = &run.stages[index];
        emit_optional(
            self.events.as_ref(),
            event_type,
            json!(StageEventData {
                run_id: run.id.clone(),
                stage: stage.name.clone(),
                stage_index: index,
                phases: (!stage.phases.is_empty()).then_some(stage.phases.len()),
                status: Some(stage.status.to_string()),
                error,
            }),
        );
    }

    fn emit_run(&self, event_type: &str, run: &PipelineRun) {
        emit_optional(
            self.events.as_ref(),
            event_type,
            json!({
                "run_id": run.id,
                "status": run.status.as_str(),
                "completed_stages": run.completed_stages(),
                "total_stages": run.stages.len(),
            }),
        );
    }
}

/// Reset every stage that is not complete so it runs again. Failed stages count a
/// retry; completed phases of a phased stage keep their output for reuse.
fn prepare_resume(mut run: PipelineRun) -> PipelineRun {
    for stage in run.stages.iter_mut().filter(|s| !s.is_complete()) {
        if stage.status == StageStatus::Failed {
            stage.retry_count += 1;
        }
        stage.status = StageStatus::Pending;
        stage.failure = None;
        stage.output = None;
        stage.finished_at = None;
        for record in stage
            .phases
            .iter_mut()
            .filter(|r| r.status != StageStatus::Complete)
        {
            record.status = StageStatus::Pending;
            record.output = None;
        }
    }
    run.current_stage = run.next_pending().unwrap_or(run.stages.len());
    run
}

fn failure_report(err: &UnitError) -> StageFailure {
    let category = match err {
        UnitError::Fatal { kind, .. } => kind.as_str(),
        UnitError::Cancelled { .. } => "cancelled",
        UnitError::SwarmAllDronesFailed { .. } => "swarm_all_drones_failed",
        UnitError::Aborted(_) => "aborted",
    };
    StageFailure {
        category: category.to_string(),
        attempts: err.attempts(),
        partial_output: err.partial_output().to_string(),
        message: err.to_string(),
    }
}
