//! Telemetry domain: event schema, sequencing runtime and sinks.

mod types;

pub mod events;
pub mod runtime;
pub mod sinks;

pub use events::{
    ProgressEvent, RetryEventData, SchedulerStatsData, StageEventData, SwarmEventData,
    UnitEventData,
};
pub use runtime::{emit_optional, EventContext, ProgressRuntime};
pub use sinks::{JsonlSink, MemorySink, ProgressSink};
pub use types::{new_run_id, new_session_id, now_millis};
