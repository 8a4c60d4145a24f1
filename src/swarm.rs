//! Swarm Coordinator
//!
//! Ensemble generation for flagged stages: D drone units answer the same prompt at
//! jittered temperatures, an arbiter unit merges the surviving drafts, and bounded
//! critique/revise rounds run while the arbiter is not satisfied.
//!
//! The coordinator itself holds no scheduler slot; only its drone, arbiter and
//! refinement units do, so an ensemble never starves itself under a small budget.

pub mod prompts;
pub mod verdict;

use crate::error::UnitError;
use crate::generation::{GenerationEngine, GenerationRequest};
use crate::jitter::JitterSource;
use crate::telemetry::{emit_optional, SwarmEventData};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use prompts::candidate_label;
pub use verdict::{parse_trailer, ArbiterStatus, ArbiterVerdict};

/// Swarm configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Stages that run in ensemble mode
    #[serde(default)]
    pub stages: Vec<String>,

    /// Drone count (D)
    #[serde(default = "default_drones")]
    pub drones: usize,

    /// Drone temperatures are sampled from `base ± temperature_jitter`
    #[serde(default = "default_temperature_jitter")]
    pub temperature_jitter: f32,

    /// Seed for temperature sampling; entropy when unset
    #[serde(default)]
    pub seed: Option<u64>,

    /// Arbiter confidence below this triggers refinement
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Hard cap on critique/revise rounds
    #[serde(default = "default_max_refinement_rounds")]
    pub max_refinement_rounds: u32,

    #[serde(default = "default_arbiter_temperature")]
    pub arbiter_temperature: f32,
}

fn default_drones() -> usize {
    3
}

fn default_temperature_jitter() -> f32 {
    0.2
}

fn default_confidence_threshold() -> f32 {
    0.7
}

fn default_max_refinement_rounds() -> u32 {
    2
}

fn default_arbiter_temperature() -> f32 {
    0.3
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            drones: default_drones(),
            temperature_jitter: default_temperature_jitter(),
            seed: None,
            confidence_threshold: default_confidence_threshold(),
            max_refinement_rounds: default_max_refinement_rounds(),
            arbiter_temperature: default_arbiter_temperature(),
        }
    }
}

impl SwarmConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.drones == 0 {
            return Err("drones must be at least 1".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature_jitter) {
            return Err("temperature_jitter must be within 0.0..=2.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err("confidence_threshold must be within 0.0..=1.0".to_string());
        }
        if !(0.0..=2.0).contains(&self.arbiter_temperature) {
            return Err("arbiter_temperature must be within 0.0..=2.0".to_string());
        }
        Ok(())
    }

    pub fn is_ensemble(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s == stage)
    }
}

/// One successful drone draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroneResponse {
    pub label: String,
    pub unit_id: String,
    pub temperature: f32,
    pub text: String,
}

/// Final merged result of an ensemble request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterSynthesis {
    pub text: String,
    pub confidence: Option<f32>,
    pub rationale: Option<String>,
    pub status: ArbiterStatus,
    /// Labels of the drafts the arbiter saw
    pub candidates: Vec<String>,
    pub rounds: u32,
}

pub struct SwarmCoordinator {
    engine: GenerationEngine,
    config: SwarmConfig,
    jitter: Mutex<JitterSource>,
}

impl SwarmCoordinator {
    pub fn new(engine: GenerationEngine, config: SwarmConfig) -> Self {
        let jitter = Mutex::new(JitterSource::from_option(config.seed));
        Self {
            engine,
            config,
            jitter,
        }
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Drone temperatures, sampled once per drone at fan-out.
    pub fn sample_temperatures(&self, base: f32) -> Vec<f32> {
        let range = self.config.temperature_jitter as f64;
        let mut jitter = self.jitter.lock();
        (0..self.config.drones)
            .map(|_| (base as f64 + jitter.uniform(-range, range)).clamp(0.0, 2.0) as f32)
            .collect()
    }

    pub async fn run(&self, request: GenerationRequest) -> Result<ArbiterSynthesis, UnitError> {
        let unit_id = request.unit_id.clone();
        let events = self.engine.events();

        // Fan-out
        let temperatures = self.sample_temperatures(request.params.temperature);
        let handles: Vec<_> = temperatures
            .iter()
            .enumerate()
            .map(|(i, temperature)| {
                let drone = request.derive(
                    format!("{}/drone-{}", unit_id, i + 1),
                    request.messages.clone(),
                    *temperature,
                );
                self.engine.submit(drone)
            })
            .collect();
        info!(unit_id = %unit_id, drones = handles.len(), "Swarm fan-out");
        emit_optional(
            events,
            "swarm_fanout",
            serde_json::json!(SwarmEventData {
                unit_id: unit_id.clone(),
                drones: handles.len(),
                succeeded: None,
                confidence: None,
                round: None,
            }),
        );

        let results = futures::future::join_all(handles.into_iter().map(|h| h.join())).await;
        if request.cancel.is_cancelled() {
            return Err(UnitError::Cancelled {
                attempts: 0,
                partial_output: String::new(),
            });
        }

        let mut drones = Vec::new();
        let mut last_error = None;
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(output) => drones.push(DroneResponse {
                    label: candidate_label(i),
                    unit_id: output.unit_id,
                    temperature: temperatures[i],
                    text: output.text,
                }),
                Err(err) => {
                    warn!(unit_id = %unit_id, drone = i + 1, error = %err, "Drone excluded");
                    last_error = Some(err);
                }
            }
        }
        if drones.is_empty() {
            let last = last_error.unwrap_or_else(|| UnitError::Aborted("no drones ran".to_string()));
            return Err(UnitError::SwarmAllDronesFailed {
                drones: temperatures.len(),
                last: Box::new(last),
            });
        }

        // Fan-in
        let candidates: Vec<(String, String)> = drones
            .iter()
            .map(|d| (d.label.clone(), d.text.clone()))
            .collect();
        let arbiter = GenerationRequest {
            messages: prompts::arbiter_messages(&request.messages, &candidates),
            params: crate::provider::GenerationParams {
                temperature: self.config.arbiter_temperature,
                ..request.params.clone()
            },
            ..request.clone()
        };
        let merged = self.engine.generate(arbiter).await?;
        let (mut text, mut verdict) = parse_trailer(&merged.text);
        info!(
            unit_id = %unit_id,
            candidates = drones.len(),
            confidence = ?verdict.confidence,
            status = ?verdict.status,
            "Arbiter synthesis ready"
        );
        emit_optional(
            events,
            "swarm_arbitrated",
            serde_json::json!(SwarmEventData {
                unit_id: unit_id.clone(),
                drones: temperatures.len(),
                succeeded: Some(drones.len()),
                confidence: verdict.confidence,
                round: None,
            }),
        );

        // Refinement
        let mut rounds = 0;
        while rounds < self.config.max_refinement_rounds
            && !verdict.accepted(self.config.confidence_threshold)
        {
            rounds += 1;
            match self.refine(&request, &text, &verdict, rounds).await {
                Ok((revised, revised_verdict)) => {
                    text = revised;
                    verdict = revised_verdict;
                    emit_optional(
                        events,
                        "swarm_refined",
                        serde_json::json!(SwarmEventData {
                            unit_id: unit_id.clone(),
                            drones: temperatures.len(),
                            succeeded: Some(drones.len()),
                            confidence: verdict.confidence,
                            round: Some(rounds),
                        }),
                    );
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(unit_id = %unit_id, round = rounds, error = %err, "Refinement round failed, keeping last synthesis");
                    break;
                }
            }
        }

        Ok(ArbiterSynthesis {
            text,
            confidence: verdict.confidence,
            rationale: verdict.rationale,
            status: verdict.status,
            candidates: drones.into_iter().map(|d| d.label).collect(),
            rounds,
        })
    }

    async fn refine(
        &self,
        request: &GenerationRequest,
        draft: &str,
        verdict: &ArbiterVerdict,
        round: u32,
    ) -> Result<(String, ArbiterVerdict), UnitError> {
        let temperature = self.config.arbiter_temperature;
        let critique = self
            .engine
            .generate(request.derive(
                format!("{}/critique-{}", request.unit_id, round),
                prompts::critique_messages(&request.messages, draft, verdict),
                temperature,
            ))
            .await?;
        let revision = self
            .engine
            .generate(request.derive(
                format!("{}/revise-{}", request.unit_id, round),
                prompts::revise_messages(&request.messages, draft, &critique.text),
                temperature,
            ))
            .await?;
        Ok(parse_trailer(&revision.text))
    }
}
