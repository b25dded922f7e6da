//! Result types for a run

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::SharedContext;
use crate::error::FailureCause;
use crate::observability::RunTrace;
use crate::worker::WorkerName;

/// Why and where a run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub cause: FailureCause,
    /// Last active worker, if the run got past dispatch.
    pub worker: Option<WorkerName>,
    /// Steps executed when the failure occurred.
    pub step: usize,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.worker {
            Some(worker) => write!(f, "{} (at worker '{}', step {})", self.cause, worker, self.step),
            None => write!(f, "{} (at step {})", self.cause, self.step),
        }
    }
}

impl std::error::Error for RunFailure {}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum RunOutcome {
    Success(Value),
    Failure(RunFailure),
}

/// The single artifact a run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Steps (handoffs + capability calls) executed.
    pub steps: usize,
    /// Worker holding control when the run ended.
    pub final_worker: WorkerName,
    /// Context as it stood when the run ended.
    pub context: SharedContext,
    pub trace: RunTrace,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Success(_))
    }

    /// Final output of a successful run.
    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            RunOutcome::Success(v) => Some(v),
            RunOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match &self.outcome {
            RunOutcome::Success(_) => None,
            RunOutcome::Failure(f) => Some(f),
        }
    }

    /// Convert into a plain `Result`, dropping the trace and context.
    pub fn into_result(self) -> Result<Value, RunFailure> {
        match self.outcome {
            RunOutcome::Success(v) => Ok(v),
            RunOutcome::Failure(f) => Err(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(outcome: RunOutcome) -> RunResult {
        RunResult {
            run_id: Uuid::new_v4(),
            outcome,
            steps: 2,
            final_worker: "Research".into(),
            context: SharedContext::new(),
            trace: RunTrace::new(),
        }
    }

    #[test]
    fn success_accessors() {
        let r = result(RunOutcome::Success(json!("email body")));
        assert!(r.is_success());
        assert_eq!(r.output(), Some(&json!("email body")));
        assert!(r.failure().is_none());
        assert_eq!(r.into_result().unwrap(), json!("email body"));
    }

    #[test]
    fn failure_display_names_worker_and_step() {
        let failure = RunFailure {
            cause: FailureCause::CancellationRequested,
            worker: Some("Research".into()),
            step: 3,
        };
        assert_eq!(
            failure.to_string(),
            "run cancelled (at worker 'Research', step 3)"
        );
        let r = result(RunOutcome::Failure(failure.clone()));
        assert!(!r.is_success());
        assert_eq!(r.failure(), Some(&failure));
        assert!(r.output().is_none());
    }

    #[test]
    fn outcome_serializes_with_status() {
        let json = serde_json::to_value(RunOutcome::Success(json!(1))).unwrap();
        assert_eq!(json, json!({"status": "success", "value": 1}));
    }
}
