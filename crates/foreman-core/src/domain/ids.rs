//! Domain identifiers.
//!
//! Task ids are plain strings on disk so humans and older tooling can create
//! them, but inside the crate they travel as a `TaskId` newtype so a task id
//! cannot be confused with an agent name.
//!
//! Generated ids look like `task-01J...` (ULID): the timestamp half keeps them
//! roughly sortable by creation, the random half keeps concurrent producers
//! from colliding. See `ports::id_generator`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a Task (unique, immutable once created).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub const PREFIX: &'static str = "task-";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
