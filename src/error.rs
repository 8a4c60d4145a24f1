//! Error types for the Blueprint generation pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Provider failure taxonomy.
///
/// Transports that only expose raw status codes map them into these kinds
/// (see [`ProviderError::from_status`]) before the retry policy classifies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Auth,
    Quota,
    RateLimit,
    TransientNetwork,
    Timeout,
    MalformedRequest,
    Unknown,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::Quota => "quota",
            ProviderErrorKind::RateLimit => "rate_limit",
            ProviderErrorKind::TransientNetwork => "transient_network",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::MalformedRequest => "malformed_request",
            ProviderErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a generation provider for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Quota, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimit, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::TransientNetwork, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::MalformedRequest, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unknown, message)
    }

    /// Map an HTTP status code and response body into the provider taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            402 => ProviderErrorKind::Quota,
            429 if body.contains("insufficient_quota") => ProviderErrorKind::Quota,
            429 => ProviderErrorKind::RateLimit,
            400 | 404 | 413 | 422 => ProviderErrorKind::MalformedRequest,
            408 | 500..=599 => ProviderErrorKind::TransientNetwork,
            _ => ProviderErrorKind::Unknown,
        };
        Self::new(kind, format!("status {}: {}", status, body))
    }
}

/// Terminal failure of one generation unit.
#[derive(Debug, Clone, Error)]
pub enum UnitError {
    #[error("provider error ({kind}) after {attempts} attempt(s): {message}")]
    Fatal {
        kind: ProviderErrorKind,
        message: String,
        attempts: u32,
        retries_exhausted: bool,
        partial_output: String,
    },

    #[error("unit cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, partial_output: String },

    #[error("all {drones} drones failed; last error: {last}")]
    SwarmAllDronesFailed { drones: usize, last: Box<UnitError> },

    #[error("unit aborted: {0}")]
    Aborted(String),
}

impl UnitError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UnitError::Cancelled { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            UnitError::Fatal { attempts, .. } | UnitError::Cancelled { attempts, .. } => *attempts,
            UnitError::SwarmAllDronesFailed { last, .. } => last.attempts(),
            UnitError::Aborted(_) => 0,
        }
    }

    pub fn partial_output(&self) -> &str {
        match self {
            UnitError::Fatal { partial_output, .. }
            | UnitError::Cancelled { partial_output, .. } => partial_output,
            UnitError::SwarmAllDronesFailed { last, .. } => last.partial_output(),
            UnitError::Aborted(_) => "",
        }
    }

    pub(crate) fn with_partial_output(mut self, text: String) -> Self {
        match &mut self {
            UnitError::Fatal { partial_output, .. }
            | UnitError::Cancelled { partial_output, .. } => *partial_output = text,
            UnitError::SwarmAllDronesFailed { .. } | UnitError::Aborted(_) => {}
        }
        self
    }
}

/// StreamHub errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Stream already open for unit: {0}")]
    AlreadyOpen(String),

    #[error("No open stream for unit: {0}")]
    UnknownUnit(String),
}

/// Checkpoint persistence errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found for run: {0}")]
    NotFound(String),

    #[error("Checkpoint corrupted at {path:?}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("Refusing to checkpoint run {run_id}: stage '{stage}' is still in flight")]
    MidStage { run_id: String, stage: String },

    #[error("Checkpoint serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid run id '{0}': must be a plain file name")]
    InvalidRunId(String),

    #[error("Checkpoint I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Top-level pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Provider error: {0}")]
    ProviderError(#[from] ProviderError),

    #[error("Checkpoint error: {0}")]
    CheckpointError(#[from] CheckpointError),

    #[error("Stream error: {0}")]
    StreamError(#[from] StreamError),

    #[error("Invalid run: {0}")]
    InvalidRun(String),

    #[error("Run already finished: {0}")]
    RunFinished(String),
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::ConfigError(err.to_string())
    }
}
