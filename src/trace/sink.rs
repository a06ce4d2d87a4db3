//! Concurrent event sink shared by the trace collectors
//!
//! Probe callbacks publish from their own threads while the owning collector
//! waits out the trace window. The collector reads a bucket only after the
//! probe has been torn down, so reads need no coordination with writers.

use crate::{NodescopeError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use nodescope_common::ContainerRecord;
use std::collections::HashMap;
use std::sync::Arc;

/// Event key -> stringified event, one per trace name
pub type TraceBucket = HashMap<String, String>;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct TraceSink {
    buckets: Arc<DashMap<String, TraceBucket>>,
    clock: Clock,
}

impl TraceSink {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Sink whose event keys are stamped by `clock`
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Store `content` in the bucket for `trace_name`, creating the bucket if needed.
    ///
    /// Keys carry nanosecond timestamps. Two events for the same container
    /// stamped within the same nanosecond share a key and the later one wins.
    pub fn publish_event(
        &self,
        trace_name: &str,
        container: Option<&ContainerRecord>,
        content: String,
    ) {
        let key = event_key(container, (self.clock)());
        self.buckets
            .entry(trace_name.to_string())
            .or_default()
            .insert(key, content);
    }

    /// Copy of the bucket for `trace_name`.
    ///
    /// Asking for a trace that never received an event is an error rather
    /// than an empty bucket.
    pub fn tracer_data(&self, trace_name: &str) -> Result<TraceBucket> {
        self.buckets
            .get(trace_name)
            .map(|bucket| bucket.value().clone())
            .ok_or_else(|| NodescopeError::EmptyTrace(trace_name.to_string()))
    }

    pub fn event_count(&self, trace_name: &str) -> usize {
        self.buckets.get(trace_name).map(|b| b.len()).unwrap_or(0)
    }
}

impl Default for TraceSink {
    fn default() -> Self {
        Self::new()
    }
}

fn event_key(container: Option<&ContainerRecord>, at: DateTime<Utc>) -> String {
    let timestamp = at.to_rfc3339_opts(SecondsFormat::Nanos, true);
    match container {
        Some(c) => format!("{} {}", c.path(), timestamp),
        None => timestamp,
    }
}
