//! Retry policy for a single generation call.
//!
//! Classifies provider failures, retries transient ones with capped exponential
//! backoff plus jitter, bounds every attempt with the per-call timeout and honors
//! cancellation at every suspension point.

use crate::cancel::CancelToken;
use crate::error::{ProviderError, ProviderErrorKind, UnitError};
use crate::jitter::JitterSource;
use crate::telemetry::{emit_optional, EventContext, RetryEventData};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per unit, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Timeout applied to each provider attempt
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Add uniform jitter in `[0, delay / 2)` to every backoff
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Seed for the jitter generator; entropy when unset
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_call_timeout_ms() -> u64 {
    120_000
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            jitter: true,
            seed: None,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.call_timeout_ms == 0 {
            return Err("call_timeout_ms must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) must not be below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        Ok(())
    }
}

/// Retry classification of one provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// Per-unit classifier state. `Unknown` errors get one transient pass.
#[derive(Debug, Default)]
pub struct Classifier {
    unknown_seen: bool,
}

impl Classifier {
    pub fn classify(&mut self, kind: ProviderErrorKind) -> ErrorClass {
        match kind {
            ProviderErrorKind::TransientNetwork
            | ProviderErrorKind::Timeout
            | ProviderErrorKind::RateLimit => ErrorClass::Transient,
            ProviderErrorKind::Auth
            | ProviderErrorKind::Quota
            | ProviderErrorKind::MalformedRequest => ErrorClass::Fatal,
            ProviderErrorKind::Unknown => {
                if self.unknown_seen {
                    ErrorClass::Fatal
                } else {
                    self.unknown_seen = true;
                    ErrorClass::Transient
                }
            }
        }
    }
}

pub struct RetryPolicy {
    config: RetryConfig,
    jitter: Mutex<JitterSource>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let jitter = Mutex::new(JitterSource::from_option(config.seed));
        Self { config, jitter }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms)
    }

    /// Capped exponential delay before retry number `retry` (0-based), without jitter.
    pub fn capped_delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay before retry number `retry`, jitter included.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let capped = self.capped_delay(retry);
        if !self.config.jitter || capped.is_zero() {
            return capped;
        }
        let extra = self.jitter.lock().uniform(0.0, capped.as_secs_f64() * 0.5);
        capped + Duration::from_secs_f64(extra)
    }

    /// Drive `attempt` until it succeeds, fails fatally, runs out of attempts or
    /// `cancel` fires. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        unit_id: &str,
        cancel: &CancelToken,
        events: Option<&EventContext>,
        mut attempt: F,
    ) -> Result<T, UnitError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut classifier = Classifier::default();
        let mut number = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(number));
            }
            number += 1;
            debug!(unit_id, attempt = number, "Starting provider attempt");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(number)),
                outcome = tokio::time::timeout(self.call_timeout(), attempt(number)) => outcome,
            };
            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => ProviderError::timeout(format!(
                    "attempt exceeded {} ms",
                    self.config.call_timeout_ms
                )),
            };
            if cancel.is_cancelled() {
                return Err(cancelled(number));
            }

            if classifier.classify(err.kind) == ErrorClass::Fatal {
                warn!(unit_id, attempt = number, kind = %err.kind, error = %err.message, "Fatal provider error");
                return Err(fatal(err, number, false));
            }
            if number >= self.config.max_attempts {
                warn!(unit_id, attempts = number, kind = %err.kind, error = %err.message, "Retries exhausted");
                return Err(fatal(err, number, true));
            }

            let delay = self.backoff_delay(number - 1);
            warn!(
                unit_id,
                attempt = number,
                kind = %err.kind,
                delay_ms = delay.as_millis() as u64,
                "Transient provider error, retrying"
            );
            emit_optional(
                events,
                "unit_retry",
                serde_json::json!(RetryEventData {
                    unit_id: unit_id.to_string(),
                    attempt: number,
                    error_kind: err.kind.as_str().to_string(),
                    delay_ms: delay.as_millis(),
                }),
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(number)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn cancelled(attempts: u32) -> UnitError {
    UnitError::Cancelled {
        attempts,
        partial_output: String::new(),
    }
}

fn fatal(err: ProviderError, attempts: u32, retries_exhausted: bool) -> UnitError {
    UnitError::Fatal {
        kind: err.kind,
        message: err.message,
        attempts,
        retries_exhausted,
        partial_output: String::new(),
    }
}
