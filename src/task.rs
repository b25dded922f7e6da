//! Run input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Immutable input to one run: free text plus optional structured fields.
///
/// Structured fields (for example `name` and `profileUrl` for an outreach
/// run) seed the run's [`SharedContext`](crate::context::SharedContext)
/// before the first worker turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub text: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Task {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Attach a structured field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

impl From<&str> for Task {
    fn from(text: &str) -> Self {
        Task::new(text)
    }
}
