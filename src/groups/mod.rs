//! Worker groups: who starts a run and who may take over
//!
//! This module provides the two static pieces of a worker group:
//!
//! ## Dispatcher - "WHO starts the run?"
//! - Routes an incoming task to its first worker
//! - One-time decision at run start, from ordered rules with a default
//!
//! ## WorkerRegistry - "WHO may hand off to whom?"
//! - Name → index table over every worker definition
//! - Holds the handoff graph; targets are resolved by name at each step,
//!   so cycles in the graph are fine
//!
//! Both are validated together when an engine is built. A rule, default, or
//! handoff that names an unregistered worker is a configuration error and
//! the engine refuses to start.
//!
//! ```rust
//! use tower_handoff::groups::{Dispatcher, RoutingRule};
//! use tower_handoff::Task;
//!
//! let dispatcher = Dispatcher::new("General")
//!     .rule(RoutingRule::keywords(["gene", "CRISPR"], "Biology"))
//!     .rule(RoutingRule::keywords(["algorithm", "programming"], "ComputerScience"));
//!
//! assert_eq!(dispatcher.route(&Task::new("explain CRISPR")), "Biology");
//! assert_eq!(dispatcher.route(&Task::new("climate economics")), "General");
//! ```

mod dispatch;

pub use dispatch::{Dispatcher, RoutingRule, RulePredicate};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::capability::CapabilityRouter;
use crate::error::{ConfigurationError, Result};
use crate::worker::{OutputType, WorkerDef, WorkerName, WorkerSvc};

/// A worker definition as stored in the registry.
pub struct RegisteredWorker {
    pub name: WorkerName,
    pub instructions: Arc<str>,
    /// Shared with every request this worker receives.
    pub handoffs: Arc<[WorkerName]>,
    pub capabilities: Arc<[String]>,
    pub output_type: Option<OutputType>,
    service: Mutex<WorkerSvc>,
}

impl RegisteredWorker {
    pub fn may_hand_off_to(&self, target: &WorkerName) -> bool {
        self.handoffs.contains(target)
    }

    pub fn may_invoke(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Fresh handle to the worker's behavior for one turn.
    pub async fn service(&self) -> WorkerSvc {
        self.service.lock().await.clone()
    }
}

impl std::fmt::Debug for RegisteredWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredWorker")
            .field("name", &self.name)
            .field("handoffs", &self.handoffs)
            .field("capabilities", &self.capabilities)
            .field("output_type", &self.output_type)
            .finish()
    }
}

/// Immutable name → worker table with a validated handoff graph.
#[derive(Debug)]
pub struct WorkerRegistry {
    name_to_index: HashMap<WorkerName, usize>,
    workers: Vec<RegisteredWorker>,
}

impl WorkerRegistry {
    /// Register `defs`, checking that names are unique, that every handoff
    /// target is registered, and that every capability a worker lists is
    /// known to `capabilities`.
    pub fn new(defs: Vec<WorkerDef>, capabilities: &CapabilityRouter) -> Result<Self> {
        let mut name_to_index = HashMap::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            if name_to_index.insert(def.name.clone(), i).is_some() {
                return Err(ConfigurationError::DuplicateWorker(def.name.clone()));
            }
        }

        for def in &defs {
            if let Some(target) = def
                .handoffs
                .iter()
                .find(|t| !name_to_index.contains_key(*t))
            {
                return Err(ConfigurationError::UnknownHandoffTarget {
                    worker: def.name.clone(),
                    target: target.clone(),
                });
            }
            if let Some(cap) = def.capabilities.iter().find(|c| !capabilities.contains(c)) {
                return Err(ConfigurationError::UnknownCapability {
                    worker: def.name.clone(),
                    capability: cap.clone(),
                });
            }
            debug!(worker = %def.name, handoffs = ?def.handoffs, capabilities = ?def.capabilities, "registered worker");
        }

        let workers = defs
            .into_iter()
            .map(|def| RegisteredWorker {
                name: def.name,
                instructions: def.instructions,
                handoffs: Arc::from(def.handoffs),
                capabilities: def.capabilities.into_iter().collect(),
                output_type: def.output_type,
                service: Mutex::new(def.service),
            })
            .collect();

        Ok(Self {
            name_to_index,
            workers,
        })
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredWorker> {
        self.name_to_index.get(name).map(|&i| &self.workers[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    /// Worker names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &WorkerName> {
        self.workers.iter().map(|w| &w.name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
