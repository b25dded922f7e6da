//! Budgets: steps and wall-clock time
//!
//! What this module provides
//! - `TurnBudget { max_steps, max_time }`: the limits of one run
//! - `BudgetUsage { steps, handoffs, capability_calls, start_time }`: running counters
//!
//! A step is a handoff or a capability call. Worker turns that end the run
//! are not steps. The orchestrator asks [`TurnBudget::check`] before it
//! executes each step; a breach ends the run with `BudgetExceeded`. Because
//! the check happens strictly before execution, a run never executes more
//! than `max_steps` steps, and a handoff cycle under a budget of N stops
//! after exactly N.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::FailureCause;

/// Step limit used when none is configured.
pub const DEFAULT_MAX_STEPS: usize = 10;

/// Limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnBudget {
    pub max_steps: usize,
    pub max_time: Option<Duration>,
}

impl Default for TurnBudget {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_time: None,
        }
    }
}

impl TurnBudget {
    pub fn steps(max_steps: usize) -> Self {
        Self {
            max_steps,
            max_time: None,
        }
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Whether one more step may execute given `usage`.
    pub fn check(&self, usage: &BudgetUsage) -> Option<BudgetBreach> {
        // Check time budget first
        if let Some(max) = self.max_time {
            if usage.start_time.elapsed() >= max {
                return Some(BudgetBreach::Time { max });
            }
        }
        if usage.steps >= self.max_steps {
            return Some(BudgetBreach::Steps {
                max: self.max_steps,
            });
        }
        None
    }
}

/// Which limit was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetBreach {
    Steps { max: usize },
    Time { max: Duration },
}

impl fmt::Display for BudgetBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetBreach::Steps { max } => write!(f, "{} steps", max),
            BudgetBreach::Time { max } => write!(f, "{}ms wall-clock", max.as_millis()),
        }
    }
}

impl From<BudgetBreach> for FailureCause {
    fn from(breach: BudgetBreach) -> Self {
        FailureCause::BudgetExceeded {
            limit: breach.to_string(),
        }
    }
}

/// Running counters during a run.
///
/// `start_time` is a tokio instant so a paused test clock drives the
/// wall-clock limit.
#[derive(Debug, Clone)]
pub struct BudgetUsage {
    pub steps: usize,
    pub handoffs: usize,
    pub capability_calls: usize,
    pub start_time: Instant,
}

impl Default for BudgetUsage {
    fn default() -> Self {
        Self {
            steps: 0,
            handoffs: 0,
            capability_calls: 0,
            start_time: Instant::now(),
        }
    }
}

impl BudgetUsage {
    pub fn record_handoff(&mut self) {
        self.handoffs += 1;
        self.steps += 1;
    }

    pub fn record_capability_call(&mut self) {
        self.capability_calls += 1;
        self.steps += 1;
    }
}
