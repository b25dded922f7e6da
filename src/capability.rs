//! Capabilities: named side-effecting operations invoked on behalf of workers.
//!
//! A capability is any Tower service `Value -> Value` with `BoxError` errors,
//! boxed as [`CapabilitySvc`]. Each one is registered with the context field
//! its result is written to. [`CapabilityRouter`] resolves a
//! [`CapabilityCall`] by name through a name → index table and converts
//! every way an invocation can go wrong into a [`CapabilityFailure`]:
//! provider errors, unknown names, timeouts (each provider is wrapped in a
//! [`TimeoutLayer`] when the router is built) and provider panics.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tower::util::BoxCloneService;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::error::{panic_message, CapabilityFailure, CapabilityFailureKind, ConfigurationError, Result};
use crate::resilience::{Elapsed, TimeoutLayer};

/// Boxed capability provider.
pub type CapabilitySvc = BoxCloneService<Value, Value, BoxError>;

/// A worker's request to run a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCall {
    pub name: String,
    pub input: Value,
}

impl CapabilityCall {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

/// Definition of a capability: name, target context field, and provider.
pub struct CapabilityDef {
    pub name: String,
    pub description: String,
    /// Context field that receives the capability's result.
    pub context_field: String,
    pub parameters_schema: Value,
    pub service: CapabilitySvc,
}

impl CapabilityDef {
    /// Wrap an existing provider service.
    pub fn new<S>(name: impl Into<String>, context_field: impl Into<String>, service: S) -> Self
    where
        S: Service<Value, Response = Value, Error = BoxError> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            context_field: context_field.into(),
            parameters_schema: Value::Null,
            service: BoxCloneService::new(service),
        }
    }

    /// Create a capability from a handler that takes JSON input and returns JSON.
    pub fn from_handler(
        name: impl Into<String>,
        context_field: impl Into<String>,
        parameters_schema: Value,
        handler: Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, BoxError>> + Send + Sync>,
    ) -> Self {
        let svc = tower::service_fn(move |input: Value| (handler.as_ref())(input));
        let mut def = Self::new(name, context_field, svc);
        def.parameters_schema = parameters_schema;
        def
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl std::fmt::Debug for CapabilityDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDef")
            .field("name", &self.name)
            .field("context_field", &self.context_field)
            .finish()
    }
}

/// Create a capability from a typed handler.
/// - `A` is the input struct (Deserialize + JsonSchema)
/// - `R` is the output type (Serialize)
pub fn capability_typed<A, H, Fut, R>(
    name: impl Into<String>,
    context_field: impl Into<String>,
    handler: H,
) -> CapabilityDef
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    R: Serialize + Send + 'static,
    H: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
{
    let schema = schemars::schema_for!(A);
    let params_value = serde_json::to_value(&schema.schema).unwrap_or_default();
    let handler = Arc::new(handler);
    let erased: Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, BoxError>> + Send + Sync> =
        Arc::new(move |raw: Value| {
            let h = handler.clone();
            Box::pin(async move {
                let args: A = serde_json::from_value(raw)?;
                let out: R = (h.as_ref())(args).await?;
                Ok(serde_json::to_value(out)?)
            })
        });
    CapabilityDef::from_handler(name, context_field, params_value, erased)
}

/// Router over registered capabilities using a name → index table.
///
/// Index 0 is always the unknown-capability fallback. Boxed services are not
/// `Sync`, so each sits behind a mutex that is only held long enough to clone it.
#[derive(Clone)]
pub struct CapabilityRouter {
    name_to_index: Arc<HashMap<String, usize>>,
    services: Arc<Vec<Mutex<CapabilitySvc>>>,
    context_fields: Arc<Vec<String>>,
    descriptions: Arc<Vec<(String, String, Value)>>,
}

impl CapabilityRouter {
    /// Router without a per-invocation time limit.
    pub fn new(defs: Vec<CapabilityDef>) -> Result<Self> {
        Self::with_timeout(defs, None)
    }

    /// Router whose providers are each wrapped in a [`TimeoutLayer`].
    pub fn with_timeout(defs: Vec<CapabilityDef>, timeout: Option<Duration>) -> Result<Self> {
        let unknown = BoxCloneService::new(tower::service_fn(|_input: Value| async move {
            Err::<Value, BoxError>("unknown capability".into())
        }));

        let mut services: Vec<Mutex<CapabilitySvc>> = vec![Mutex::new(unknown)];
        let mut context_fields = vec![String::new()];
        let mut descriptions = Vec::with_capacity(defs.len());
        let mut name_to_index = HashMap::new();

        for def in defs {
            if name_to_index.contains_key(&def.name) {
                return Err(ConfigurationError::DuplicateCapability(def.name));
            }
            if def.context_field.is_empty() {
                return Err(ConfigurationError::MissingContextField(def.name));
            }
            name_to_index.insert(def.name.clone(), services.len());
            let service = match timeout {
                Some(limit) => BoxCloneService::new(TimeoutLayer::new(limit).layer(def.service)),
                None => def.service,
            };
            services.push(Mutex::new(service));
            context_fields.push(def.context_field);
            descriptions.push((def.name, def.description, def.parameters_schema));
        }

        Ok(Self {
            name_to_index: Arc::new(name_to_index),
            services: Arc::new(services),
            context_fields: Arc::new(context_fields),
            descriptions: Arc::new(descriptions),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    /// Context field a capability writes to.
    pub fn context_field(&self, name: &str) -> Option<&str> {
        self.name_to_index
            .get(name)
            .map(|&i| self.context_fields[i].as_str())
    }

    /// Registered capability names with their descriptions and input schemas.
    pub fn describe(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.descriptions
            .iter()
            .map(|(n, d, s)| (n.as_str(), d.as_str(), s))
    }

    /// Run a capability and classify any error as a [`CapabilityFailure`].
    pub async fn invoke(&self, call: CapabilityCall) -> std::result::Result<Value, CapabilityFailure> {
        let name = call.name.clone();
        if !self.contains(&name) {
            warn!(capability = %name, "unknown capability requested");
            return Err(CapabilityFailure::new(
                name.clone(),
                CapabilityFailureKind::UnknownCapability,
                format!("unknown capability: {}", name),
            ));
        }

        let fut = ServiceExt::oneshot(self.clone(), call);
        let result = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(r) => r,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(capability = %name, panic = %message, "capability panicked");
                return Err(CapabilityFailure::upstream(
                    name,
                    format!("capability panicked: {}", message),
                ));
            }
        };

        match result {
            Ok(value) => {
                debug!(capability = %name, "capability succeeded");
                Ok(value)
            }
            Err(e) if e.is::<Elapsed>() => {
                warn!(capability = %name, error = %e, "capability timed out");
                Err(CapabilityFailure::new(name, CapabilityFailureKind::Timeout, e.to_string()))
            }
            Err(e) => {
                warn!(capability = %name, error = %e, "capability failed");
                Err(CapabilityFailure::upstream(name, e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for CapabilityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.name_to_index.keys().collect();
        names.sort();
        f.debug_struct("CapabilityRouter")
            .field("capabilities", &names)
            .finish()
    }
}

impl Service<CapabilityCall> for CapabilityRouter {
    type Response = Value;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        // Readiness is checked on the selected service inside `call`.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CapabilityCall) -> Self::Future {
        let idx = self
            .name_to_index
            .get(req.name.as_str())
            .copied()
            .unwrap_or(0);
        let services = self.services.clone();
        Box::pin(async move {
            let svc = services[idx].lock().await.clone();
            svc.oneshot(req.input).await
        })
    }
}
