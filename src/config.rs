//! Engine configuration
//!
//! The worker graph, routing rules, capability mappings and budgets can be
//! declared as data ([`EngineConfig`], TOML or JSON) and bound to behavior
//! services by name with [`EngineBuilder`]. Unknown keys are rejected. Services themselves are code,
//! so every configured worker and capability must be bound before the
//! engine will build.
//!
//! ```toml
//! default_worker = "General"
//! max_steps = 8
//! capability_timeout_ms = 2000
//!
//! [[routes]]
//! target = "Biology"
//! keywords = ["gene", "CRISPR"]
//!
//! [[workers]]
//! name = "Biology"
//! instructions = "Answer biology questions."
//! capabilities = ["webSearch"]
//!
//! [[workers]]
//! name = "General"
//!
//! [[capabilities]]
//! name = "webSearch"
//! context_field = "searchResults"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::{BoxError, Service};
use tower::util::BoxCloneService;
use tracing::{debug, warn};

use crate::budgets::{TurnBudget, DEFAULT_MAX_STEPS};
use crate::capability::{CapabilityDef, CapabilitySvc};
use crate::error::{ConfigurationError, Result};
use crate::groups::{Dispatcher, RoutingRule};
use crate::observability::TraceSinkSvc;
use crate::orchestrator::Orchestrator;
use crate::worker::{WorkerAction, WorkerDef, WorkerName, WorkerRequest, WorkerSvc};

/// Declarative engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker used when no routing rule matches.
    pub default_worker: Option<WorkerName>,

    /// Maximum handoffs plus capability calls per run.
    pub max_steps: usize,

    /// Wall-clock limit per run.
    pub max_time_ms: Option<u64>,

    /// Limit for a single capability invocation.
    pub capability_timeout_ms: Option<u64>,

    /// Routing rules, first match wins.
    pub routes: Vec<RouteSpec>,

    pub workers: Vec<WorkerSpec>,

    pub capabilities: Vec<CapabilitySpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_worker: None,
            max_steps: DEFAULT_MAX_STEPS,
            max_time_ms: None,
            capability_timeout_ms: None,
            routes: Vec::new(),
            workers: Vec::new(),
            capabilities: Vec::new(),
        }
    }
}

/// A worker as declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSpec {
    pub name: WorkerName,
    #[serde(default)]
    pub instructions: String,
    /// Allowed handoff targets, in order.
    #[serde(default)]
    pub handoffs: Vec<WorkerName>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A routing rule as declared in configuration. Exactly one predicate:
/// `keywords`, or a `field`/`equals` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    pub target: WorkerName,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub equals: Option<String>,
}

impl RouteSpec {
    fn to_rule(&self, index: usize) -> Result<RoutingRule> {
        match (&self.field, &self.equals) {
            (Some(_), _) | (_, Some(_)) if !self.keywords.is_empty() => {
                Err(ConfigurationError::Parse(format!(
                    "route #{} to '{}' mixes keywords with field/equals",
                    index, self.target
                )))
            }
            (Some(field), Some(equals)) => Ok(RoutingRule::field(
                field.clone(),
                equals.clone(),
                self.target.clone(),
            )),
            (None, None) if !self.keywords.is_empty() => Ok(RoutingRule::keywords(
                self.keywords.iter().cloned(),
                self.target.clone(),
            )),
            _ => Err(ConfigurationError::Parse(format!(
                "route #{} to '{}' needs either keywords or both field and equals",
                index, self.target
            ))),
        }
    }
}

/// A capability as declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilitySpec {
    pub name: String,
    /// Context field the result is written to.
    pub context_field: String,
    #[serde(default)]
    pub description: String,
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a file; `.json` files are read as JSON, anything else as TOML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        debug!(path = %path.display(), json = is_json, "loading engine config");
        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_toml_str(&contents)
        }
    }

    pub fn budget(&self) -> TurnBudget {
        let budget = TurnBudget::steps(self.max_steps);
        match self.max_time_ms {
            Some(ms) => budget.with_max_time(Duration::from_millis(ms)),
            None => budget,
        }
    }

    pub fn capability_timeout(&self) -> Option<Duration> {
        self.capability_timeout_ms.map(Duration::from_millis)
    }

    /// Routing rules in declared order with the default worker.
    pub fn dispatcher(&self) -> Result<Dispatcher> {
        let default = self
            .default_worker
            .clone()
            .ok_or(ConfigurationError::NoDefaultWorker)?;
        self.routes
            .iter()
            .enumerate()
            .try_fold(Dispatcher::new(default), |d, (i, route)| {
                Ok(d.rule(route.to_rule(i)?))
            })
    }
}

/// Binds an [`EngineConfig`] to worker and capability services.
pub struct EngineBuilder {
    config: EngineConfig,
    worker_services: HashMap<WorkerName, WorkerSvc>,
    capability_services: HashMap<String, CapabilitySvc>,
    extra_workers: Vec<WorkerDef>,
    extra_capabilities: Vec<CapabilityDef>,
    extra_rules: Vec<RoutingRule>,
    trace_sink: Option<TraceSinkSvc>,
}

impl EngineBuilder {
    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            worker_services: HashMap::new(),
            capability_services: HashMap::new(),
            extra_workers: Vec::new(),
            extra_capabilities: Vec::new(),
            extra_rules: Vec::new(),
            trace_sink: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bind the behavior of a configured worker.
    pub fn bind_worker<S>(mut self, name: impl Into<WorkerName>, service: S) -> Self
    where
        S: Service<WorkerRequest, Response = WorkerAction, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        self.worker_services
            .insert(name.into(), BoxCloneService::new(service));
        self
    }

    /// Bind the provider of a configured capability.
    pub fn bind_capability<S>(mut self, name: impl Into<String>, service: S) -> Self
    where
        S: Service<Value, Response = Value, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        self.capability_services
            .insert(name.into(), BoxCloneService::new(service));
        self
    }

    /// Add a worker defined entirely in code.
    pub fn worker(mut self, def: WorkerDef) -> Self {
        self.extra_workers.push(def);
        self
    }

    /// Add a capability defined entirely in code.
    pub fn capability(mut self, def: CapabilityDef) -> Self {
        self.extra_capabilities.push(def);
        self
    }

    /// Add a routing rule evaluated after the configured ones.
    pub fn rule(mut self, rule: RoutingRule) -> Self {
        self.extra_rules.push(rule);
        self
    }

    pub fn trace_sink(mut self, sink: TraceSinkSvc) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn build(mut self) -> Result<Orchestrator> {
        let mut capabilities = Vec::with_capacity(self.config.capabilities.len());
        for spec in &self.config.capabilities {
            let service = self
                .capability_services
                .remove(&spec.name)
                .ok_or_else(|| ConfigurationError::UnboundCapability(spec.name.clone()))?;
            capabilities.push(
                CapabilityDef::new(spec.name.clone(), spec.context_field.clone(), service)
                    .with_description(spec.description.clone()),
            );
        }
        for name in self.capability_services.keys() {
            warn!(capability = %name, "bound capability is not declared in config, ignoring");
        }
        capabilities.append(&mut self.extra_capabilities);

        let mut workers = Vec::with_capacity(self.config.workers.len());
        for spec in &self.config.workers {
            let service = self
                .worker_services
                .remove(&spec.name)
                .ok_or_else(|| ConfigurationError::UnboundWorker(spec.name.clone()))?;
            let mut def = WorkerDef::new(spec.name.clone(), service).instructions(&spec.instructions);
            for target in &spec.handoffs {
                def = def.handoff_to(target.clone());
            }
            for cap in &spec.capabilities {
                def = def.capability(cap.clone());
            }
            workers.push(def);
        }
        for name in self.worker_services.keys() {
            warn!(worker = %name, "bound worker is not declared in config, ignoring");
        }
        workers.append(&mut self.extra_workers);

        let dispatcher = self
            .extra_rules
            .into_iter()
            .fold(self.config.dispatcher()?, |d, rule| d.rule(rule));

        let mut builder = Orchestrator::builder()
            .workers(workers)
            .dispatcher(dispatcher)
            .budget(self.config.budget());
        for def in capabilities {
            builder = builder.capability(def);
        }
        if let Some(timeout) = self.config.capability_timeout() {
            builder = builder.capability_timeout(timeout);
        }
        if let Some(sink) = self.trace_sink {
            builder = builder.trace_sink(sink);
        }
        builder.build()
    }
}
