//! Error types for the handoff engine
//!
//! Three families live here:
//! - [`ConfigurationError`]: the worker graph or engine config is malformed.
//!   Only ever returned while building an engine, never during a run.
//! - [`FailureCause`]: why a run ended in `Terminated(failure)`.
//! - [`CapabilityFailure`]: a capability did not produce a value. Not fatal;
//!   it is handed back to the calling worker as its next payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::WorkerName;

/// Result type alias for engine construction.
pub type Result<T> = std::result::Result<T, ConfigurationError>;

/// Malformed configuration detected at startup.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A worker lists a handoff target that is not registered.
    #[error("worker '{worker}' hands off to unknown worker '{target}'")]
    UnknownHandoffTarget { worker: WorkerName, target: WorkerName },

    /// A routing rule points at an unregistered worker.
    #[error("routing rule #{index} targets unknown worker '{target}'")]
    UnknownRouteTarget { index: usize, target: WorkerName },

    /// The dispatcher default is not a registered worker.
    #[error("default worker '{0}' is not registered")]
    UnknownDefaultWorker(WorkerName),

    /// A worker lists a capability that is not registered.
    #[error("worker '{worker}' uses unknown capability '{capability}'")]
    UnknownCapability { worker: WorkerName, capability: String },

    /// Two workers share a name.
    #[error("worker '{0}' is registered twice")]
    DuplicateWorker(WorkerName),

    /// Two capabilities share a name.
    #[error("capability '{0}' is registered twice")]
    DuplicateCapability(String),

    /// A capability has no context field to write its result into.
    #[error("capability '{0}' has no context field mapping")]
    MissingContextField(String),

    /// A configured worker was never bound to a behavior service.
    #[error("worker '{0}' has no behavior bound")]
    UnboundWorker(WorkerName),

    /// A configured capability was never bound to a provider service.
    #[error("capability '{0}' has no provider bound")]
    UnboundCapability(String),

    /// No default worker was configured.
    #[error("no default worker configured")]
    NoDefaultWorker,

    /// Configuration text could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for ConfigurationError {
    fn from(err: toml::de::Error) -> Self {
        ConfigurationError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigurationError {
    fn from(err: serde_json::Error) -> Self {
        ConfigurationError::Parse(err.to_string())
    }
}

/// Cause of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// A worker asked to hand off outside its allowed set.
    #[error("routing violation: '{from}' may not hand off to '{to}'")]
    RoutingViolation { from: WorkerName, to: WorkerName },

    /// The turn budget ran out before the run finished.
    #[error("budget exceeded: {limit}")]
    BudgetExceeded { limit: String },

    /// The caller cancelled the run.
    #[error("run cancelled")]
    CancellationRequested,

    /// A worker's behavior service returned an error.
    #[error("worker '{worker}' failed: {message}")]
    WorkerFailed { worker: WorkerName, message: String },

    /// A worker's final value does not match its declared output type.
    #[error("worker '{worker}' produced invalid output: {message}")]
    OutputRejected { worker: WorkerName, message: String },
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Why a capability invocation did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityFailureKind {
    /// The backing provider reported an error.
    Upstream,
    /// No capability with that name is registered.
    UnknownCapability,
    /// Registered, but not in the calling worker's capability set.
    NotPermitted,
    /// The invocation took longer than the configured timeout.
    Timeout,
}

/// Typed capability failure delivered to the calling worker.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("capability '{capability}' failed: {message}")]
pub struct CapabilityFailure {
    pub capability: String,
    pub kind: CapabilityFailureKind,
    pub message: String,
}

impl CapabilityFailure {
    pub fn new(
        capability: impl Into<String>,
        kind: CapabilityFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            capability: capability.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn upstream(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(capability, CapabilityFailureKind::Upstream, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigurationError::UnknownHandoffTarget {
            worker: "TeamLead".into(),
            target: "Ghost".into(),
        };
        assert_eq!(
            err.to_string(),
            "worker 'TeamLead' hands off to unknown worker 'Ghost'"
        );

        let cause = FailureCause::RoutingViolation {
            from: "A".into(),
            to: "C".into(),
        };
        assert_eq!(
            cause.to_string(),
            "routing violation: 'A' may not hand off to 'C'"
        );
    }

    #[test]
    fn test_capability_failure_display() {
        let failure = CapabilityFailure::upstream("fetchProfile", "HTTP 404");
        assert_eq!(failure.kind, CapabilityFailureKind::Upstream);
        assert_eq!(
            failure.to_string(),
            "capability 'fetchProfile' failed: HTTP 404"
        );
    }

    #[test]
    fn test_failure_cause_serialization() {
        let cause = FailureCause::BudgetExceeded {
            limit: "3 steps".to_string(),
        };
        let json = serde_json::to_value(&cause).unwrap();
        assert_eq!(json["kind"], "budget_exceeded");
        let back: FailureCause = serde_json::from_value(json).unwrap();
        assert_eq!(back, cause);
    }

    #[test]
    fn test_panic_message() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 7");
        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static");
        let caught = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "unknown panic");
    }

    #[test]
    fn test_parse_error_from_toml() {
        let err: ConfigurationError = toml::from_str::<toml::Value>("= nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, ConfigurationError::Parse(_)));
    }
}
