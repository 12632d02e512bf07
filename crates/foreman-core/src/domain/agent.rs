//! Agent registry records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Agent-reported status. Not trusted for liveness on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Available,
    Busy,
    Running,
    Idle,
    Stopped,
    Error,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Available => "available",
            AgentStatus::Busy => "busy",
            AgentStatus::Running => "running",
            AgentStatus::Idle => "idle",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Error => "error",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,

    /// Current instance; absent (or 0 in old documents) when not running.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Space-joined argv of the current instance, as launched or registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,

    pub status: AgentStatus,

    pub last_seen: DateTime<Utc>,

    #[serde(default)]
    pub current_task: Option<TaskId>,

    #[serde(default)]
    pub tasks_completed: u64,

    /// Advisory, used for task-type routing.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, status: AgentStatus, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            pid: None,
            command_line: None,
            status,
            last_seen: now,
            current_task: None,
            tasks_completed: 0,
            capabilities: BTreeSet::new(),
        }
    }

    /// The recorded pid, treating 0 as "not running".
    pub fn live_pid(&self) -> Option<u32> {
        self.pid.filter(|&p| p > 0)
    }
}

/// The agent registry document (`agents.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistryDoc {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl AgentRegistryDoc {
    /// Existing record, or a fresh one in `status`.
    pub fn upsert(&mut self, name: &str, status: AgentStatus, now: DateTime<Utc>) -> &mut AgentRecord {
        self.agents
            .entry(name.to_string())
            .or_insert_with(|| AgentRecord::new(name, status, now))
    }
}
