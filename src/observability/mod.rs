//! Observability: run traces and trace sinks
//!
//! What this module provides
//! - `RunTrace`: append-only record of one run, one entry per orchestrator event
//! - `TraceEntry { step, worker, action, at }`
//! - `TraceSink`: any `Service<TraceEntry, Response = ()>` that receives
//!   entries as they are appended (persisting or shipping them is the sink's job)
//! - `tracing_sink()`: a sink that emits each entry as a `tracing` event
//!
//! Sink errors are logged and never change the outcome of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::util::BoxCloneService;
use tower::{BoxError, Service};
use tracing::info;

use crate::worker::WorkerName;

/// What happened at a trace point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceAction {
    /// The dispatcher picked the first worker.
    Dispatched,
    /// A capability ran; `ok` is false when it failed.
    CapabilityCalled { capability: String, ok: bool },
    /// Control moved to another worker.
    HandedOff { to: WorkerName },
    /// The worker produced the final output.
    Finished,
    /// The run terminated with a failure.
    Failed { cause: String },
}

/// One trace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Step counter after the event.
    pub step: usize,
    pub worker: WorkerName,
    pub action: TraceAction,
    pub at: DateTime<Utc>,
}

/// Ordered trace of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTrace {
    entries: Vec<TraceEntry>,
}

impl RunTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry stamped with the current time and return a copy of it.
    pub fn record(&mut self, step: usize, worker: WorkerName, action: TraceAction) -> TraceEntry {
        let entry = TraceEntry {
            step,
            worker,
            action,
            at: Utc::now(),
        };
        self.entries.push(entry.clone());
        entry
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Workers in the order they became active, starting with the dispatched one.
    pub fn worker_path(&self) -> Vec<&WorkerName> {
        let mut path = Vec::new();
        for e in &self.entries {
            match &e.action {
                TraceAction::Dispatched => path.push(&e.worker),
                TraceAction::HandedOff { to } => path.push(to),
                _ => {}
            }
        }
        path
    }
}

pub trait TraceSink: Service<TraceEntry, Response = (), Error = BoxError> {}
impl<T> TraceSink for T where T: Service<TraceEntry, Response = (), Error = BoxError> {}

/// Boxed trace sink.
pub type TraceSinkSvc = BoxCloneService<TraceEntry, (), BoxError>;

/// Sink that logs every entry through `tracing`.
pub fn tracing_sink() -> TraceSinkSvc {
    BoxCloneService::new(tower::service_fn(|entry: TraceEntry| async move {
        info!(
            step = entry.step,
            worker = %entry.worker,
            action = ?entry.action,
            at = %entry.at.to_rfc3339(),
            "trace"
        );
        Ok::<(), BoxError>(())
    }))
}
