//! Progress runtime: sequence assignment and fan-out to sinks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::telemetry::events::{ProgressEnvelope, ProgressEvent};
use crate::telemetry::sinks::ProgressSink;

/// Assigns per-session sequence numbers and forwards events to every registered sink.
#[derive(Clone, Default)]
pub struct ProgressRuntime {
    next_seq: Arc<Mutex<HashMap<String, u64>>>,
    sinks: Arc<Vec<Arc<dyn ProgressSink>>>,
}

impl ProgressRuntime {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self {
            next_seq: Arc::new(Mutex::new(HashMap::new())),
            sinks: Arc::new(sinks),
        }
    }

    pub fn emit_event(
        &self,
        session_id: &str,
        event_type: &str,
        data: Value,
    ) -> Result<(), std::io::Error> {
        let envelope = ProgressEnvelope::with_now(session_id, event_type, data);
        // Sequence assignment and sink writes happen under one lock so every sink
        // observes a session's events in sequence order.
        let mut counters = self.next_seq.lock();
        let seq = counters.entry(session_id.to_string()).or_insert(1);
        let event = ProgressEvent::from_envelope(envelope, *seq);
        *seq += 1;
        debug!(
            session_id = %event.session,
            seq = event.seq,
            event_type = %event.event_type,
            "progress event"
        );
        for sink in self.sinks.iter() {
            sink.record(&event)?;
        }
        Ok(())
    }

    pub fn emit_event_best_effort(&self, session_id: &str, event_type: &str, data: Value) {
        if let Err(err) = self.emit_event(session_id, event_type, data) {
            warn!(
                session_id = %session_id,
                event_type = %event_type,
                error = %err,
                "failed to emit progress event"
            );
        }
    }
}

/// Session plus runtime, carried by components that emit events.
#[derive(Clone)]
pub struct EventContext {
    pub session_id: String,
    pub progress: ProgressRuntime,
}

impl EventContext {
    pub fn new(session_id: impl Into<String>, progress: ProgressRuntime) -> Self {
        Self {
            session_id: session_id.into(),
            progress,
        }
    }

    pub fn emit(&self, event_type: &str, data: Value) {
        self.progress
            .emit_event_best_effort(&self.session_id, event_type, data);
    }
}

/// Emit through an optional context; a missing context drops the event.
pub fn emit_optional(context: Option<&EventContext>, event_type: &str, data: Value) {
    if let Some(ctx) = context {
        ctx.emit(event_type, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::sinks::MemorySink;
    use serde_json::json;

    #[test]
    fn sequence_assignment_is_monotonic_per_session() {
        let sink = Arc::new(MemorySink::default());
        let runtime = ProgressRuntime::new(vec![sink.clone()]);
        runtime.emit_event("s1", "stage_started", json!({})).unwrap();
        runtime.emit_event("s2", "stage_started", json!({})).unwrap();
        runtime.emit_event("s1", "stage_completed", json!({})).unwrap();

        let s1: Vec<u64> = sink
            .events()
            .into_iter()
            .filter(|e| e.session == "s1")
            .map(|e| e.seq)
            .collect();
        assert_eq!(s1, vec![1, 2]);
        let s2 = sink.events_of_type("stage_started");
        assert_eq!(s2.len(), 2);
    }
}
