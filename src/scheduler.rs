//! Task Scheduler
//!
//! Admits generation units under a global concurrency budget. Submissions enter one
//! unbounded FIFO channel drained by a single dispatcher task, which hands each job a
//! semaphore permit before spawning it; admission order is therefore submission order.

use crate::cancel::CancelToken;
use crate::error::UnitError;
use crate::telemetry::{emit_optional, EventContext, SchedulerStatsData, UnitEventData};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum units executing at once (K)
    #[serde(default = "default_max_concurrent_units")]
    pub max_concurrent_units: usize,

    /// Optional tighter bound on simultaneous outbound provider calls
    #[serde(default)]
    pub max_provider_calls: Option<usize>,
}

fn default_max_concurrent_units() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_units: default_max_concurrent_units(),
            max_provider_calls: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_units == 0 {
            return Err("max_concurrent_units must be at least 1".to_string());
        }
        if self.max_provider_calls == Some(0) {
            return Err("max_provider_calls must be at least 1 when set".to_string());
        }
        Ok(())
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Highest `running` value observed
    pub peak_running: usize,
}

type Job = Box<dyn FnOnce(OwnedSemaphorePermit) + Send>;

struct QueuedJob {
    unit_id: String,
    cancel: CancelToken,
    run: Job,
}

struct Shared {
    permits: Arc<Semaphore>,
    provider_gate: Option<Arc<Semaphore>>,
    stats: RwLock<SchedulerStats>,
    events: Option<EventContext>,
    limit: usize,
}

impl Shared {
    fn emit_stats(&self) {
        let data = {
            let stats = self.stats.read();
            SchedulerStatsData {
                pending: stats.pending,
                running: stats.running,
                completed: stats.completed,
                failed: stats.failed,
                cancelled: stats.cancelled,
            }
        };
        emit_optional(self.events.as_ref(), "scheduler_stats", serde_json::json!(data));
    }

    fn emit_unit(&self, event_type: &str, data: UnitEventData) {
        emit_optional(self.events.as_ref(), event_type, serde_json::json!(data));
    }

    fn skip_cancelled(&self, unit_id: &str) {
        {
            let mut stats = self.stats.write();
            stats.pending = stats.pending.saturating_sub(1);
            stats.cancelled += 1;
        }
        debug!(unit_id, "Skipping unit cancelled while queued");
        self.emit_unit("unit_cancelled", unit_event(unit_id));
        self.emit_stats();
    }
}

fn unit_event(unit_id: &str) -> UnitEventData {
    UnitEventData {
        unit_id: unit_id.to_string(),
        attempts: None,
        queued_ms: None,
        duration_ms: None,
        error: None,
    }
}

/// Cloneable scheduler handle.
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<QueuedJob>,
}

impl TaskScheduler {
    /// Create a scheduler and spawn its dispatcher. Must be called inside a Tokio runtime.
    pub fn new(config: &SchedulerConfig, events: Option<EventContext>) -> Self {
        let limit = config.max_concurrent_units.max(1);
        let shared = Arc::new(Shared {
            permits: Arc::new(Semaphore::new(limit)),
            provider_gate: config
                .max_provider_calls
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
            stats: RwLock::new(SchedulerStats::default()),
            events,
            limit,
        });
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::dispatch(shared.clone(), rx));
        info!(max_concurrent_units = limit, "Task scheduler started");
        Self { shared, queue }
    }

    async fn dispatch(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<QueuedJob>) {
        while let Some(job) = rx.recv().await {
            if job.cancel.is_cancelled() {
                shared.skip_cancelled(&job.unit_id);
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = job.cancel.cancelled() => {
                    shared.skip_cancelled(&job.unit_id);
                    continue;
                }
                permit = shared.permits.clone().acquire_owned() => permit,
            };
            match permit {
                Ok(permit) => (job.run)(permit),
                Err(_) => {
                    warn!("Scheduler semaphore closed, dispatcher stopping");
                    break;
                }
            }
        }
        debug!("Scheduler dispatcher stopped");
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.read().clone()
    }

    /// Permit for one outbound provider call when a provider budget is configured.
    pub async fn provider_permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.shared.provider_gate {
            Some(gate) => gate.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    /// Queue a unit. `work` runs once a slot frees up and receives the unit's token.
    pub fn submit<T, F, Fut>(
        &self,
        unit_id: impl Into<String>,
        cancel: CancelToken,
        work: F,
    ) -> UnitHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UnitError>> + Send + 'static,
    {
        let unit_id = unit_id.into();
        let (tx, rx) = oneshot::channel();
        let started = Arc::new(AtomicBool::new(false));
        let submitted_at = Instant::now();

        let shared = self.shared.clone();
        let job_started = started.clone();
        let job_cancel = cancel.clone();
        let job_unit = unit_id.clone();
        let run: Job = Box::new(move |permit: OwnedSemaphorePermit| {
            tokio::spawn(async move {
                job_started.store(true, Ordering::SeqCst);
                {
                    let mut stats = shared.stats.write();
                    stats.pending = stats.pending.saturating_sub(1);
                    stats.running += 1;
                    stats.peak_running = stats.peak_running.max(stats.running);
                }
                let queued_ms = submitted_at.elapsed().as_millis();
                debug!(unit_id = %job_unit, queued_ms = queued_ms as u64, "Unit admitted");
                shared.emit_unit(
                    "unit_admitted",
                    UnitEventData {
                        queued_ms: Some(queued_ms),
                        ..unit_event(&job_unit)
                    },
                );
                shared.emit_stats();

                let started_at = Instant::now();
                let work = work(job_cancel.clone());
                tokio::pin!(work);
                let result = tokio::select! {
                    biased;
                    result = &mut work => result,
                    _ = job_cancel.cancelled() => Err(UnitError::Cancelled {
                        attempts: 0,
                        partial_output: String::new(),
                    }),
                };
                // Late success after cancellation still counts as cancelled.
                let result = match result {
                    Ok(_) if job_cancel.is_cancelled() => Err(UnitError::Cancelled {
                        attempts: 0,
                        partial_output: String::new(),
                    }),
                    other => other,
                };
                let duration_ms = Some(started_at.elapsed().as_millis());

                {
                    let mut stats = shared.stats.write();
                    stats.running = stats.running.saturating_sub(1);
                    match &result {
                        Ok(_) => stats.completed += 1,
                        Err(err) if err.is_cancelled() => stats.cancelled += 1,
                        Err(_) => stats.failed += 1,
                    }
                }
                match &result {
                    Ok(_) => {
                        debug!(unit_id = %job_unit, "Unit completed");
                        shared.emit_unit(
                            "unit_completed",
                            UnitEventData {
                                duration_ms,
                                ..unit_event(&job_unit)
                            },
                        );
                    }
                    Err(err) if err.is_cancelled() => {
                        info!(unit_id = %job_unit, "Unit cancelled");
                        shared.emit_unit(
                            "unit_cancelled",
                            UnitEventData {
                                attempts: Some(err.attempts()),
                                duration_ms,
                                ..unit_event(&job_unit)
                            },
                        );
                    }
                    Err(err) => {
                        warn!(unit_id = %job_unit, error = %err, "Unit failed");
                        shared.emit_unit(
                            "unit_failed",
                            UnitEventData {
                                attempts: Some(err.attempts()),
                                duration_ms,
                                error: Some(err.to_string()),
                                ..unit_event(&job_unit)
                            },
                        );
                    }
                }
                drop(permit);
                shared.emit_stats();
                let _ = tx.send(result);
            });
        });

        self.shared.stats.write().pending += 1;
        let job = QueuedJob {
            unit_id: unit_id.clone(),
            cancel: cancel.clone(),
            run,
        };
        if self.queue.send(job).is_err() {
            warn!(unit_id = %unit_id, "Scheduler dispatcher is gone, unit dropped");
            self.shared.stats.write().pending -= 1;
        }

        UnitHandle {
            unit_id,
            cancel,
            started,
            rx,
        }
    }
}

/// Handle to one submitted unit.
pub struct UnitHandle<T> {
    unit_id: String,
    cancel: CancelToken,
    started: Arc<AtomicBool>,
    rx: oneshot::Receiver<Result<T, UnitError>>,
}

impl<T> UnitHandle<T> {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Wait for the unit's terminal result. A unit cancelled before it was admitted
    /// resolves as cancelled without waiting for the queue.
    pub async fn join(mut self) -> Result<T, UnitError> {
        tokio::select! {
            biased;
            result = &mut self.rx => return flatten(&self.unit_id, result),
            _ = self.cancel.cancelled() => {}
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(UnitError::Cancelled {
                attempts: 0,
                partial_output: String::new(),
            });
        }
        let result = (&mut self.rx).await;
        flatten(&self.unit_id, result)
    }
}

fn flatten<T>(
    unit_id: &str,
    result: Result<Result<T, UnitError>, oneshot::error::RecvError>,
) -> Result<T, UnitError> {
    match result {
        Ok(result) => result,
        // Sender dropped: either skipped while queued or the unit task died.
        Err(_) => Err(UnitError::Aborted(format!(
            "unit {} ended without reporting a result",
            unit_id
        ))),
    }
}
