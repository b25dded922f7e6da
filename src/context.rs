//! # Shared Context
//!
//! Per-run mutable state visible to every worker in a run. A context is a
//! map from field names to JSON values; every field is absent until
//! something writes it.
//!
//! The orchestrator owns the single context of a run. Workers receive an
//! `Arc<SharedContext>` snapshot with each turn and only read from it.
//! Writes happen between turns, when a capability result is stored under
//! the field mapped to that capability, so writes are strictly sequential.
//!
//! Rules enforced here:
//! - a field that has been set is never cleared for the rest of the run;
//! - a later write to a field replaces the earlier value (last writer wins).
//!
//! ```rust
//! use tower_handoff::context::{fields, SharedContext, WriteSource};
//!
//! let mut ctx = SharedContext::new();
//! assert!(ctx.get(fields::PROFILE_DATA).is_none());
//!
//! ctx.set(fields::PROFILE_DATA, serde_json::json!({"company": "Acme"}), 1, WriteSource::capability("fetchProfile"));
//! assert_eq!(ctx.get(fields::PROFILE_DATA).unwrap()["company"], "Acme");
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known field names used by the outreach and research flows.
pub mod fields {
    pub const NAME: &str = "name";
    pub const PROFILE_URL: &str = "profileUrl";
    pub const PROFILE_DATA: &str = "profileData";
    pub const GENERATED_ARTIFACT: &str = "generatedArtifact";
}

/// Who produced a context write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "name", rename_all = "snake_case")]
pub enum WriteSource {
    /// Seeded from a structured task field at run start.
    Task,
    /// Result of the named capability.
    Capability(String),
}

impl WriteSource {
    pub fn capability(name: impl Into<String>) -> Self {
        WriteSource::Capability(name.into())
    }
}

/// One recorded write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub field: String,
    pub step: usize,
    pub source: WriteSource,
}

/// Per-run field store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    values: BTreeMap<String, Value>,
    writes: Vec<FieldWrite>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Read a field and deserialize it into `T`.
    ///
    /// Returns `None` when the field is absent or has a different shape.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        self.values
            .get(field)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    /// Store `value` under `field`, replacing any earlier value.
    ///
    /// Fields cannot be removed once set.
    pub fn set(&mut self, field: impl Into<String>, value: Value, step: usize, source: WriteSource) {
        let field = field.into();
        self.writes.push(FieldWrite {
            field: field.clone(),
            step,
            source,
        });
        self.values.insert(field, value);
    }

    /// Field names currently set, in sorted order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Every write in the order it happened.
    pub fn writes(&self) -> &[FieldWrite] {
        &self.writes
    }

    /// The most recent write to `field`, if any.
    pub fn last_write(&self, field: &str) -> Option<&FieldWrite> {
        self.writes.iter().rev().find(|w| w.field == field)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Plain JSON object view of the current values.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fields_start_absent() {
        let ctx = SharedContext::new();
        assert!(ctx.is_empty());
        assert!(!ctx.contains(fields::PROFILE_DATA));
        assert!(ctx.get_as::<String>(fields::NAME).is_none());
    }

    #[test]
    fn last_writer_wins() {
        let mut ctx = SharedContext::new();
        ctx.set(
            fields::PROFILE_DATA,
            json!({"from": "x"}),
            2,
            WriteSource::capability("scrapeProfile"),
        );
        ctx.set(
            fields::PROFILE_DATA,
            json!({"from": "y"}),
            5,
            WriteSource::capability("enrichProfile"),
        );

        assert_eq!(ctx.get(fields::PROFILE_DATA), Some(&json!({"from": "y"})));
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.writes().len(), 2);
        let last = ctx.last_write(fields::PROFILE_DATA).unwrap();
        assert_eq!(last.step, 5);
        assert_eq!(last.source, WriteSource::capability("enrichProfile"));
    }

    #[test]
    fn typed_reads() {
        let mut ctx = SharedContext::new();
        ctx.set(fields::NAME, json!("Jane Doe"), 0, WriteSource::Task);
        assert_eq!(ctx.get_as::<String>(fields::NAME).as_deref(), Some("Jane Doe"));
        // wrong shape reads as absent
        assert!(ctx.get_as::<u32>(fields::NAME).is_none());
    }

    #[test]
    fn json_view_contains_all_fields() {
        let mut ctx = SharedContext::new();
        ctx.set(fields::NAME, json!("Jane"), 0, WriteSource::Task);
        ctx.set(
            fields::GENERATED_ARTIFACT,
            json!("Dear Jane"),
            3,
            WriteSource::capability("draftEmail"),
        );
        assert_eq!(
            ctx.to_json(),
            json!({"name": "Jane", "generatedArtifact": "Dear Jane"})
        );
        assert_eq!(
            ctx.field_names().collect::<Vec<_>>(),
            vec!["generatedArtifact", "name"]
        );
    }
}
