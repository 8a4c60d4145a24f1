//! Generation units: one provider call, scheduled, retried and streamed.
//!
//! A [`GenerationRequest`] becomes a scheduler unit. Inside its slot the unit opens
//! a StreamHub publisher under its own id, then drives the provider through the
//! retry policy, publishing every token as it arrives. The unit's terminal result
//! carries the text of the successful attempt only.

use crate::cancel::CancelToken;
use crate::error::UnitError;
use crate::provider::{ChatMessage, GenerationParams, GenerationProvider};
use crate::retry::RetryPolicy;
use crate::scheduler::{TaskScheduler, UnitHandle};
use crate::stream::{StreamHub, Terminal};
use crate::telemetry::EventContext;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Default sampling settings for every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model cannot be empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            ));
        }
        if self.max_tokens == Some(0) {
            return Err("max_tokens must be greater than 0 when set".to_string());
        }
        Ok(())
    }

    pub fn params(&self, unit_id: impl Into<String>) -> GenerationParams {
        GenerationParams {
            unit_id: unit_id.into(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Stage (and optional phase) a unit belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOwner {
    pub stage: String,
    pub phase: Option<u32>,
}

impl fmt::Display for UnitOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "{}#{}", self.stage, phase),
            None => f.write_str(&self.stage),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub unit_id: String,
    pub owner: UnitOwner,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
    pub cancel: CancelToken,
}

impl GenerationRequest {
    /// Derive a request for a sub-unit (drone, critique, revision) of this one.
    pub fn derive(&self, unit_id: String, messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self {
            params: GenerationParams {
                unit_id: unit_id.clone(),
                temperature,
                ..self.params.clone()
            },
            unit_id,
            owner: self.owner.clone(),
            messages,
            cancel: self.cancel.child(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutput {
    pub unit_id: String,
    pub text: String,
    pub attempts: u32,
}

/// Provider, scheduler, retry policy and hub bundled for unit execution.
#[derive(Clone)]
pub struct GenerationEngine {
    provider: Arc<dyn GenerationProvider>,
    scheduler: TaskScheduler,
    retry: Arc<RetryPolicy>,
    hub: StreamHub,
    events: Option<EventContext>,
}

impl GenerationEngine {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        scheduler: TaskScheduler,
        retry: Arc<RetryPolicy>,
        hub: StreamHub,
        events: Option<EventContext>,
    ) -> Self {
        Self {
            provider,
            scheduler,
            retry,
            hub,
            events,
        }
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> Option<&EventContext> {
        self.events.as_ref()
    }

    /// Queue the request on the scheduler.
    pub fn submit(&self, request: GenerationRequest) -> UnitHandle<UnitOutput> {
        let engine = self.clone();
        let unit_id = request.unit_id.clone();
        let cancel = request.cancel.clone();
        self.scheduler
            .submit(unit_id, cancel, move |cancel| async move {
                engine.execute(request, cancel).await
            })
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<UnitOutput, UnitError> {
        self.submit(request).join().await
    }

    async fn execute(
        &self,
        request: GenerationRequest,
        cancel: CancelToken,
    ) -> Result<UnitOutput, UnitError> {
        let publisher = self
            .hub
            .open(&request.unit_id)
            .map_err(|e| UnitError::Aborted(e.to_string()))?;
        debug!(unit_id = %request.unit_id, owner = %request.owner, "Unit executing");

        let current = Mutex::new(String::new());
        let attempts = Mutex::new(0u32);
        let result = self
            .retry
            .run(&request.unit_id, &cancel, self.events.as_ref(), |attempt| {
                let publisher = &publisher;
                let current = &current;
                let attempts = &attempts;
                let request = &request;
                let cancel = &cancel;
                async move {
                    *attempts.lock() = attempt;
                    publisher.begin_attempt(attempt);
                    current.lock().clear();
                    let _call = self.scheduler.provider_permit().await;
                    let mut tokens = self
                        .provider
                        .submit(&request.messages, &request.params, cancel)
                        .await?;
                    while let Some(token) = tokens.next().await {
                        let token = token?;
                        current.lock().push_str(&token);
                        publisher.publish(token);
                    }
                    Ok(current.lock().clone())
                }
            })
            .await;

        let result = match result {
            Ok(_) if cancel.is_cancelled() => Err(UnitError::Cancelled {
                attempts: *attempts.lock(),
                partial_output: String::new(),
            }),
            other => other,
        };

        match result {
            Ok(text) => {
                publisher.close(Terminal::Ok);
                let attempts = *attempts.lock();
                info!(unit_id = %request.unit_id, attempts, chars = text.len(), "Unit generated");
                Ok(UnitOutput {
                    unit_id: request.unit_id,
                    text,
                    attempts,
                })
            }
            Err(err) => {
                let err = err.with_partial_output(current.lock().clone());
                if err.is_cancelled() {
                    publisher.close(Terminal::Cancelled);
                } else {
                    publisher.close(Terminal::Error(err.to_string()));
                }
                Err(err)
            }
        }
    }
}
