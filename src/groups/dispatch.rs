//! Initial worker selection.

use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;

use tower::Service;
use tracing::debug;

use super::WorkerRegistry;
use crate::error::{ConfigurationError, Result};
use crate::task::Task;
use crate::worker::WorkerName;

/// Predicate over a task.
#[derive(Clone)]
pub enum RulePredicate {
    /// Any keyword occurs in the task text, ignoring case.
    Keywords(Vec<String>),
    /// A structured task field equals `equals`, ignoring case.
    Field { name: String, equals: String },
    /// Code-defined predicate.
    Custom(Arc<dyn Fn(&Task) -> bool + Send + Sync>),
}

impl RulePredicate {
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            RulePredicate::Keywords(keywords) => {
                let text = task.text.to_lowercase();
                keywords
                    .iter()
                    .filter(|k| !k.is_empty())
                    .any(|k| text.contains(&k.to_lowercase()))
            }
            RulePredicate::Field { name, equals } => task
                .field(name)
                .is_some_and(|v| v.eq_ignore_ascii_case(equals)),
            RulePredicate::Custom(f) => f(task),
        }
    }
}

impl std::fmt::Debug for RulePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RulePredicate::Keywords(k) => f.debug_tuple("Keywords").field(k).finish(),
            RulePredicate::Field { name, equals } => f
                .debug_struct("Field")
                .field("name", name)
                .field("equals", equals)
                .finish(),
            RulePredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A `(predicate, target)` pair.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub predicate: RulePredicate,
    pub target: WorkerName,
}

impl RoutingRule {
    pub fn keywords<I, K>(keywords: I, target: impl Into<WorkerName>) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            predicate: RulePredicate::Keywords(keywords.into_iter().map(Into::into).collect()),
            target: target.into(),
        }
    }

    pub fn field(
        name: impl Into<String>,
        equals: impl Into<String>,
        target: impl Into<WorkerName>,
    ) -> Self {
        Self {
            predicate: RulePredicate::Field {
                name: name.into(),
                equals: equals.into(),
            },
            target: target.into(),
        }
    }

    pub fn custom<F>(f: F, target: impl Into<WorkerName>) -> Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: RulePredicate::Custom(Arc::new(f)),
            target: target.into(),
        }
    }
}

/// Ordered routing rules with a default worker. First match wins.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    rules: Arc<Vec<RoutingRule>>,
    default: WorkerName,
}

impl Dispatcher {
    pub fn new(default: impl Into<WorkerName>) -> Self {
        Self {
            rules: Arc::new(Vec::new()),
            default: default.into(),
        }
    }

    /// Append a rule; earlier rules take priority.
    pub fn rule(mut self, rule: RoutingRule) -> Self {
        Arc::make_mut(&mut self.rules).push(rule);
        self
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn default_worker(&self) -> &WorkerName {
        &self.default
    }

    /// Pick the first worker for `task`.
    pub fn route(&self, task: &Task) -> &WorkerName {
        match self
            .rules
            .iter()
            .enumerate()
            .find(|(_, r)| r.predicate.matches(task))
        {
            Some((index, rule)) => {
                debug!(rule = index, target = %rule.target, "routing rule matched");
                &rule.target
            }
            None => {
                debug!(target = %self.default, "no routing rule matched, using default");
                &self.default
            }
        }
    }

    /// Check that every target and the default are registered workers.
    pub fn validate(&self, registry: &WorkerRegistry) -> Result<()> {
        if !registry.contains(self.default.as_str()) {
            return Err(ConfigurationError::UnknownDefaultWorker(self.default.clone()));
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if !registry.contains(rule.target.as_str()) {
                return Err(ConfigurationError::UnknownRouteTarget {
                    index,
                    target: rule.target.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Service<Task> for Dispatcher {
    type Response = WorkerName;
    type Error = Infallible;
    type Future = Ready<std::result::Result<WorkerName, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, task: Task) -> Self::Future {
        ready(Ok(self.route(&task).clone()))
    }
}
