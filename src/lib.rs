//! # tower-handoff
//!
//! A Tower-based engine for running a task through a small team of
//! cooperating workers. A run is routed to its first worker by ordered rules,
//! then proceeds as a strictly sequential chain of handoffs and capability
//! calls over a shared, per-run context until some worker produces a final
//! answer, a handoff breaks the routing contract, the turn budget runs out,
//! or the run is cancelled.
//!
//! ## Core Concepts
//!
//! - **Worker**: a Tower service `WorkerRequest -> WorkerAction` plus static
//!   data (instructions, allowed handoff targets, permitted capabilities)
//! - **Capability**: a Tower service `Value -> Value` whose result is written
//!   into a fixed field of the shared context
//! - **Dispatcher**: ordered routing rules with a default; first match wins
//! - **Orchestrator**: the run loop, enforcing the handoff graph and budget
//!
//! ## Getting Started
//!
//! ```rust
//! use tower_handoff::{
//!     worker_fn, Dispatcher, Orchestrator, RoutingRule, Task, TurnBudget, WorkerAction, WorkerDef,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let triage = WorkerDef::new(
//!     "Triage",
//!     worker_fn(|_req| async move { Ok(WorkerAction::handoff("Biology")) }),
//! )
//! .handoff_to("Biology");
//!
//! let biology = WorkerDef::new(
//!     "Biology",
//!     worker_fn(|req| async move {
//!         Ok(WorkerAction::final_output(format!("biology notes on '{}'", req.task.text)))
//!     }),
//! );
//!
//! let engine = Orchestrator::builder()
//!     .worker(triage)
//!     .worker(biology)
//!     .dispatcher(Dispatcher::new("Triage").rule(RoutingRule::keywords(["CRISPR"], "Biology")))
//!     .budget(TurnBudget::steps(5))
//!     .build()?;
//!
//! let result = engine.run(Task::new("explain CRISPR")).await;
//! assert!(result.is_success());
//! assert_eq!(result.steps, 0);
//! # Ok(())
//! # }
//! ```

pub mod budgets;
pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod groups;
pub mod observability;
pub mod orchestrator;
pub mod resilience;
pub mod result;
pub mod task;
pub mod worker;

// Public re-exports for convenience
pub use budgets::{BudgetUsage, TurnBudget};
pub use capability::{capability_typed, CapabilityCall, CapabilityDef, CapabilityRouter, CapabilitySvc};
pub use config::{EngineBuilder, EngineConfig};
pub use context::{SharedContext, WriteSource};
pub use error::{CapabilityFailure, CapabilityFailureKind, ConfigurationError, FailureCause, Result};
pub use groups::{Dispatcher, RoutingRule, WorkerRegistry};
pub use observability::{tracing_sink, RunTrace, TraceAction, TraceEntry};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunRequest};
pub use result::{RunFailure, RunOutcome, RunResult};
pub use task::Task;
pub use worker::{
    worker_fn, HandoffRequest, OutputType, Payload, WorkerAction, WorkerDef, WorkerName, WorkerRequest,
    WorkerSvc,
};

// Re-export Tower traits that users need
pub use tower::{BoxError, Service, ServiceExt};
pub use tokio_util::sync::CancellationToken;
