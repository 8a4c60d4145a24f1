//! Blueprint: a staged LLM planning pipeline.
//!
//! Turns a project brief into a design, a phased plan, per-phase specs and a handoff
//! document. Generation units run under a shared concurrency budget with retries and
//! live token streaming; every completed stage is checkpointed so runs can resume.

pub mod cancel;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod jitter;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod stream;
pub mod swarm;
pub mod telemetry;
