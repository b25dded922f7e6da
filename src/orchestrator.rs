//! # Orchestrator
//!
//! The orchestrator drives one run at a time per call and any number of runs
//! concurrently. Each run is a strictly sequential state machine:
//!
//! ```text
//! Dispatching ─► Running(w) ─┬─ Final(v) ─────────────► Terminated(success)
//!                    ▲       ├─ Call(c) ── invoke ──► Running(w)
//!                    │       ├─ Handoff(t), t allowed ─► Running(t)
//!                    └───────┘  Handoff(t), t not allowed ─► Terminated(failure)
//! ```
//!
//! Before every worker turn the cancellation token is checked. Before every
//! step (handoff or capability call) the turn budget is checked. Both end
//! the run with a failure when tripped, so every run terminates and always
//! yields exactly one [`RunResult`]. A panicking worker behavior ends the
//! run with `WorkerFailed`; a panicking capability is a capability failure.
//!
//! Worker and capability definitions are shared read-only across runs.
//! Each run owns its [`SharedContext`], step counter, and trace.

use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::budgets::{BudgetUsage, TurnBudget};
use crate::capability::{CapabilityDef, CapabilityRouter};
use crate::context::{SharedContext, WriteSource};
use crate::error::{
    panic_message, CapabilityFailure, CapabilityFailureKind, ConfigurationError, FailureCause, Result,
};
use crate::groups::{Dispatcher, WorkerRegistry};
use crate::observability::{RunTrace, TraceAction, TraceSinkSvc};
use crate::result::{RunFailure, RunOutcome, RunResult};
use crate::task::Task;
use crate::worker::{Payload, WorkerAction, WorkerDef, WorkerName, WorkerRequest};

/// Request form used by the `Service` implementation.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub task: Task,
    /// Overrides the engine's default budget.
    pub budget: Option<TurnBudget>,
    pub cancel: Option<CancellationToken>,
}

impl From<Task> for RunRequest {
    fn from(task: Task) -> Self {
        Self {
            task,
            budget: None,
            cancel: None,
        }
    }
}

struct Inner {
    registry: WorkerRegistry,
    dispatcher: Dispatcher,
    capabilities: CapabilityRouter,
    budget: TurnBudget,
    trace_sink: Option<Mutex<TraceSinkSvc>>,
}

/// The run scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workers", &self.inner.registry.len())
            .field("capabilities", &self.inner.capabilities)
            .field("budget", &self.inner.budget)
            .finish()
    }
}

/// Builder collecting workers, capabilities, and routing before validation.
#[derive(Default)]
pub struct OrchestratorBuilder {
    workers: Vec<WorkerDef>,
    capabilities: Vec<CapabilityDef>,
    dispatcher: Option<Dispatcher>,
    budget: TurnBudget,
    capability_timeout: Option<Duration>,
    trace_sink: Option<TraceSinkSvc>,
}

impl OrchestratorBuilder {
    pub fn worker(mut self, worker: WorkerDef) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn workers(mut self, workers: impl IntoIterator<Item = WorkerDef>) -> Self {
        self.workers.extend(workers);
        self
    }

    pub fn capability(mut self, capability: CapabilityDef) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Default budget for runs that do not supply one.
    pub fn budget(mut self, budget: TurnBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Per-invocation limit; exceeding it is a `Timeout` capability failure.
    pub fn capability_timeout(mut self, timeout: Duration) -> Self {
        self.capability_timeout = Some(timeout);
        self
    }

    pub fn trace_sink(mut self, sink: TraceSinkSvc) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    /// Validate the worker graph and routing, then freeze it.
    pub fn build(self) -> Result<Orchestrator> {
        let capabilities = CapabilityRouter::with_timeout(self.capabilities, self.capability_timeout)?;
        let registry = WorkerRegistry::new(self.workers, &capabilities)?;
        let dispatcher = self.dispatcher.ok_or(ConfigurationError::NoDefaultWorker)?;
        dispatcher.validate(&registry)?;

        info!(
            workers = registry.len(),
            rules = dispatcher.rules().len(),
            default = %dispatcher.default_worker(),
            max_steps = self.budget.max_steps,
            "orchestrator ready"
        );

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                registry,
                dispatcher,
                capabilities,
                budget: self.budget,
                trace_sink: self.trace_sink.map(Mutex::new),
            }),
        })
    }
}

/// Mutable state owned by a single run.
struct RunState {
    run_id: Uuid,
    context: Arc<SharedContext>,
    trace: RunTrace,
    usage: BudgetUsage,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn capabilities(&self) -> &CapabilityRouter {
        &self.inner.capabilities
    }

    pub fn default_budget(&self) -> TurnBudget {
        self.inner.budget
    }

    /// Run `task` with the default budget.
    pub async fn run(&self, task: Task) -> RunResult {
        self.run_with_cancel(task, self.inner.budget, CancellationToken::new())
            .await
    }

    pub async fn run_with_budget(&self, task: Task, budget: TurnBudget) -> RunResult {
        self.run_with_cancel(task, budget, CancellationToken::new())
            .await
    }

    /// Run `task`, cancelling it between steps once `deadline` has elapsed.
    pub async fn run_with_deadline(&self, task: Task, deadline: Duration) -> RunResult {
        let cancel = CancellationToken::new();
        let timer_token = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            timer_token.cancel();
        });
        let result = self.run_with_cancel(task, self.inner.budget, cancel).await;
        timer.abort();
        result
    }

    /// Run `task` under `budget`, observing `cancel` between steps.
    pub async fn run_with_cancel(
        &self,
        task: Task,
        budget: TurnBudget,
        cancel: CancellationToken,
    ) -> RunResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, task = %task.text, max_steps = budget.max_steps);
        self.drive(run_id, task, budget, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        run_id: Uuid,
        task: Task,
        budget: TurnBudget,
        cancel: CancellationToken,
    ) -> RunResult {
        let inner = &self.inner;
        let task = Arc::new(task);

        let mut context = SharedContext::new();
        for (field, value) in &task.fields {
            context.set(field.clone(), Value::String(value.clone()), 0, WriteSource::Task);
        }
        let mut state = RunState {
            run_id,
            context: Arc::new(context),
            trace: RunTrace::new(),
            usage: BudgetUsage::default(),
        };

        // Dispatching
        let mut current = inner.dispatcher.route(&task).clone();
        info!(worker = %current, "dispatched");
        self.emit(&mut state, current.clone(), TraceAction::Dispatched)
            .await;
        let mut payload = Payload::Start;

        loop {
            if cancel.is_cancelled() {
                return self
                    .fail(state, current, FailureCause::CancellationRequested)
                    .await;
            }

            let Some(worker) = inner.registry.get(current.as_str()) else {
                let cause = FailureCause::WorkerFailed {
                    worker: current.clone(),
                    message: "worker is not registered".to_string(),
                };
                return self.fail(state, current, cause).await;
            };

            let request = WorkerRequest {
                run_id,
                worker: current.clone(),
                instructions: worker.instructions.clone(),
                handoffs: worker.handoffs.clone(),
                capabilities: worker.capabilities.clone(),
                task: task.clone(),
                context: state.context.clone(),
                payload,
                step: state.usage.steps,
            };
            debug!(worker = %current, step = state.usage.steps, "worker turn");
            let turn = AssertUnwindSafe(worker.service().await.oneshot(request)).catch_unwind();
            let action = match turn.await {
                Ok(Ok(action)) => action,
                Ok(Err(e)) => {
                    let cause = FailureCause::WorkerFailed {
                        worker: current.clone(),
                        message: e.to_string(),
                    };
                    return self.fail(state, current, cause).await;
                }
                Err(panic) => {
                    let cause = FailureCause::WorkerFailed {
                        worker: current.clone(),
                        message: format!("worker panicked: {}", panic_message(panic.as_ref())),
                    };
                    return self.fail(state, current, cause).await;
                }
            };

            match action {
                WorkerAction::Final(value) => {
                    if let Some(output_type) = &worker.output_type {
                        if let Err(message) = output_type.check(&value) {
                            let cause = FailureCause::OutputRejected {
                                worker: current.clone(),
                                message,
                            };
                            return self.fail(state, current, cause).await;
                        }
                    }
                    info!(worker = %current, steps = state.usage.steps, "run finished");
                    self.emit(&mut state, current.clone(), TraceAction::Finished)
                        .await;
                    return RunResult {
                        run_id,
                        outcome: RunOutcome::Success(value),
                        steps: state.usage.steps,
                        final_worker: current,
                        context: Arc::unwrap_or_clone(state.context),
                        trace: state.trace,
                    };
                }
                WorkerAction::Handoff(req) => {
                    if !worker.may_hand_off_to(&req.target)
                        || !inner.registry.contains(req.target.as_str())
                    {
                        let cause = FailureCause::RoutingViolation {
                            from: current.clone(),
                            to: req.target,
                        };
                        return self.fail(state, current, cause).await;
                    }
                    if let Some(cause) = self.before_step(&state, &budget, &cancel) {
                        return self.fail(state, current, cause).await;
                    }

                    state.usage.record_handoff();
                    info!(from = %current, to = %req.target, reason = ?req.reason, step = state.usage.steps, "handoff");
                    self.emit(
                        &mut state,
                        current.clone(),
                        TraceAction::HandedOff {
                            to: req.target.clone(),
                        },
                    )
                    .await;
                    payload = Payload::Handoff {
                        from: current,
                        reason: req.reason,
                        data: req.payload,
                    };
                    current = req.target;
                }
                WorkerAction::Call(call) => {
                    if let Some(cause) = self.before_step(&state, &budget, &cancel) {
                        return self.fail(state, current, cause).await;
                    }

                    state.usage.record_capability_call();
                    let name = call.name.clone();
                    debug!(worker = %current, capability = %name, step = state.usage.steps, "capability call");
                    let result = if inner.capabilities.contains(&name) && !worker.may_invoke(&name) {
                        warn!(worker = %current, capability = %name, "capability not permitted");
                        Err(CapabilityFailure::new(
                            name.clone(),
                            CapabilityFailureKind::NotPermitted,
                            format!("worker '{}' may not invoke '{}'", current, name),
                        ))
                    } else {
                        inner.capabilities.invoke(call).await
                    };

                    let ok = result.is_ok();
                    payload = match result {
                        Ok(output) => {
                            if let Some(field) = inner.capabilities.context_field(&name) {
                                Arc::make_mut(&mut state.context).set(
                                    field,
                                    output.clone(),
                                    state.usage.steps,
                                    WriteSource::capability(name.clone()),
                                );
                            }
                            Payload::CapabilityResult {
                                capability: name.clone(),
                                output,
                            }
                        }
                        Err(failure) => Payload::CapabilityFailed(failure),
                    };
                    self.emit(
                        &mut state,
                        current.clone(),
                        TraceAction::CapabilityCalled {
                            capability: name,
                            ok,
                        },
                    )
                    .await;
                }
            }
        }
    }

    /// Checks that gate every handoff and capability call.
    fn before_step(
        &self,
        state: &RunState,
        budget: &TurnBudget,
        cancel: &CancellationToken,
    ) -> Option<FailureCause> {
        if let Some(breach) = budget.check(&state.usage) {
            return Some(breach.into());
        }
        if cancel.is_cancelled() {
            return Some(FailureCause::CancellationRequested);
        }
        None
    }

    async fn fail(&self, mut state: RunState, worker: WorkerName, cause: FailureCause) -> RunResult {
        warn!(worker = %worker, step = state.usage.steps, cause = %cause, "run failed");
        self.emit(
            &mut state,
            worker.clone(),
            TraceAction::Failed {
                cause: cause.to_string(),
            },
        )
        .await;
        RunResult {
            run_id: state.run_id,
            outcome: RunOutcome::Failure(RunFailure {
                cause,
                worker: Some(worker.clone()),
                step: state.usage.steps,
            }),
            steps: state.usage.steps,
            final_worker: worker,
            context: Arc::unwrap_or_clone(state.context),
            trace: state.trace,
        }
    }

    async fn emit(&self, state: &mut RunState, worker: WorkerName, action: TraceAction) {
        let entry = state.trace.record(state.usage.steps, worker, action);
        if let Some(sink) = &self.inner.trace_sink {
            let svc = sink.lock().await.clone();
            if let Err(e) = svc.oneshot(entry).await {
                warn!(error = %e, "trace sink rejected entry");
            }
        }
    }
}

impl Service<RunRequest> for Orchestrator {
    type Response = RunResult;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RunRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let budget = req.budget.unwrap_or(this.inner.budget);
            let cancel = req.cancel.unwrap_or_default();
            Ok(this.run_with_cancel(req.task, budget, cancel).await)
        })
    }
}
