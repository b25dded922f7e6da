//! # Workers
//!
//! A worker is an addressable unit of specialized behavior. Its definition
//! is static data: a name, instruction text, the ordered list of workers it
//! may hand off to, and the capabilities it may invoke. Its behavior is a
//! Tower service that receives a [`WorkerRequest`] and answers with exactly
//! one [`WorkerAction`] per call:
//!
//! - [`WorkerAction::Final`] ends the run with a value;
//! - [`WorkerAction::Handoff`] transfers control to another worker;
//! - [`WorkerAction::Call`] asks the orchestrator to run a capability and
//!   re-invoke this worker with the result.
//!
//! How a worker picks its action (rules, a model call, a lookup table) is
//! opaque to the orchestrator. Each request carries the worker's allowed
//! handoff targets and capabilities so the behavior can choose among them.
//!
//! A worker may declare an output type with [`WorkerDef::output_type`]; a
//! `Final` value that does not deserialize into it ends the run with
//! [`FailureCause::OutputRejected`](crate::error::FailureCause::OutputRejected).
//!
//! ```rust
//! use tower_handoff::worker::{worker_fn, HandoffRequest, WorkerAction, WorkerDef};
//!
//! let triage = WorkerDef::new(
//!     "Triage",
//!     worker_fn(|_req| async move {
//!         Ok(WorkerAction::Handoff(HandoffRequest::to("General")))
//!     }),
//! )
//! .instructions("Route the query to a specialist.")
//! .handoff_to("General");
//!
//! assert!(triage.may_hand_off_to(&"General".into()));
//! assert!(!triage.may_hand_off_to(&"Biology".into()));
//! ```

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::util::BoxCloneService;
use tower::{BoxError, Service};
use uuid::Uuid;

use crate::capability::CapabilityCall;
use crate::context::SharedContext;
use crate::error::CapabilityFailure;
use crate::task::Task;

/// Stable worker identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerName(String);

impl WorkerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for WorkerName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for WorkerName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for WorkerName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Request to transfer control to another worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRequest {
    /// Worker that takes over.
    pub target: WorkerName,
    /// Data seeding the target's first turn.
    pub payload: Option<Value>,
    pub reason: Option<String>,
}

impl HandoffRequest {
    pub fn to(target: impl Into<WorkerName>) -> Self {
        Self {
            target: target.into(),
            payload: None,
            reason: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// The single decision a worker makes per turn.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerAction {
    Final(Value),
    Handoff(HandoffRequest),
    Call(CapabilityCall),
}

impl WorkerAction {
    pub fn final_output(value: impl Into<Value>) -> Self {
        WorkerAction::Final(value.into())
    }

    pub fn handoff(target: impl Into<WorkerName>) -> Self {
        WorkerAction::Handoff(HandoffRequest::to(target))
    }

    pub fn call(capability: impl Into<String>, input: Value) -> Self {
        WorkerAction::Call(CapabilityCall::new(capability, input))
    }
}

/// What a worker receives at the start of a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// First turn of the run; the task is on the request.
    Start,
    /// Control was handed over by another worker.
    Handoff {
        from: WorkerName,
        reason: Option<String>,
        data: Option<Value>,
    },
    /// The capability this worker called succeeded.
    CapabilityResult { capability: String, output: Value },
    /// The capability this worker called failed.
    CapabilityFailed(CapabilityFailure),
}

/// Input to one worker turn.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub run_id: Uuid,
    pub worker: WorkerName,
    pub instructions: Arc<str>,
    /// Workers this one may hand off to, in declared order.
    pub handoffs: Arc<[WorkerName]>,
    /// Capabilities this worker may invoke, sorted.
    pub capabilities: Arc<[String]>,
    pub task: Arc<Task>,
    /// Read-only snapshot of the run's context.
    pub context: Arc<SharedContext>,
    pub payload: Payload,
    /// Steps (handoffs + capability calls) executed so far.
    pub step: usize,
}

impl WorkerRequest {
    pub fn may_hand_off_to(&self, target: &str) -> bool {
        self.handoffs.iter().any(|t| t == target)
    }

    pub fn may_invoke(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Boxed worker behavior.
pub type WorkerSvc = BoxCloneService<WorkerRequest, WorkerAction, BoxError>;

/// Build a worker behavior from an async closure.
pub fn worker_fn<F, Fut>(f: F) -> WorkerSvc
where
    F: Fn(WorkerRequest) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<WorkerAction, BoxError>> + Send + 'static,
{
    BoxCloneService::new(tower::service_fn(f))
}

/// Declared shape of a worker's final value.
///
/// Built from a Rust type: the JSON schema comes from `schemars` and the
/// check deserializes the value into that type.
#[derive(Clone)]
pub struct OutputType {
    pub name: &'static str,
    pub schema: Value,
    check: Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>,
}

impl OutputType {
    pub fn of<T>() -> Self
    where
        T: DeserializeOwned + JsonSchema + 'static,
    {
        let schema = schemars::schema_for!(T);
        Self {
            name: std::any::type_name::<T>(),
            schema: serde_json::to_value(&schema.schema).unwrap_or_default(),
            check: Arc::new(|value: &Value| {
                T::deserialize(value).map(|_| ()).map_err(|e| e.to_string())
            }),
        }
    }

    /// `Err` carries the deserialization message.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        (self.check)(value)
    }
}

impl fmt::Debug for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputType").field("name", &self.name).finish()
    }
}

/// Static definition of a worker plus its behavior.
#[derive(Clone)]
pub struct WorkerDef {
    pub name: WorkerName,
    pub instructions: Arc<str>,
    /// Allowed handoff targets, in declared order.
    pub handoffs: Vec<WorkerName>,
    pub capabilities: BTreeSet<String>,
    pub output_type: Option<OutputType>,
    pub service: WorkerSvc,
}

impl WorkerDef {
    pub fn new<S>(name: impl Into<WorkerName>, service: S) -> Self
    where
        S: Service<WorkerRequest, Response = WorkerAction, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self {
            name: name.into(),
            instructions: Arc::from(""),
            handoffs: Vec::new(),
            capabilities: BTreeSet::new(),
            output_type: None,
            service: BoxCloneService::new(service),
        }
    }

    pub fn instructions(mut self, text: impl AsRef<str>) -> Self {
        self.instructions = Arc::from(text.as_ref());
        self
    }

    /// Allow handing off to `target`. Repeats are ignored.
    pub fn handoff_to(mut self, target: impl Into<WorkerName>) -> Self {
        let target = target.into();
        if !self.handoffs.contains(&target) {
            self.handoffs.push(target);
        }
        self
    }

    pub fn capability(mut self, name: impl Into<String>) -> Self {
        self.capabilities.insert(name.into());
        self
    }

    /// Require this worker's final value to deserialize into `T`.
    pub fn output_type<T>(mut self) -> Self
    where
        T: DeserializeOwned + JsonSchema + 'static,
    {
        self.output_type = Some(OutputType::of::<T>());
        self
    }

    pub fn may_hand_off_to(&self, target: &WorkerName) -> bool {
        self.handoffs.contains(target)
    }

    pub fn may_invoke(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

impl fmt::Debug for WorkerDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDef")
            .field("name", &self.name)
            .field("handoffs", &self.handoffs)
            .field("capabilities", &self.capabilities)
            .field("output_type", &self.output_type)
            .finish()
    }
}
