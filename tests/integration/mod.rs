//! Integration tests for the Blueprint planning pipeline

mod checkpoint_store;
mod config_integration;
mod end_to_end;
mod resume;
mod retry_policy;
mod scheduler_budget;
mod stream_hub;
mod swarm_ensemble;
mod test_utils;
