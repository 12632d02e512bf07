//! Append-only history documents: failures, restarts, dead letters.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
}

/// A threshold crossing whose debug task is not known to be enqueued yet.
///
/// Written in the same update as the failure that crossed, removed once the
/// debug task with `debug_task_id` is in the task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEscalation {
    pub debug_task_id: TaskId,
    pub agent_name: String,
    pub description: String,
    pub raised_at: DateTime<Utc>,
}

/// `failures.json`: sliding-window tuples, per-agent, per-task-type
/// consecutive failure counters, and crossings still owed a debug task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureLog {
    #[serde(default)]
    pub failures: Vec<FailureRecord>,

    #[serde(default)]
    pub consecutive: BTreeMap<String, BTreeMap<String, u32>>,

    #[serde(default)]
    pub pending: Vec<PendingEscalation>,
}

impl FailureLog {
    /// Drop `agent`'s tuples older than `now - window`; returns how many remain.
    pub fn prune(&mut self, agent: &str, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        self.failures
            .retain(|f| f.agent_name != agent || f.timestamp >= cutoff);
        self.failures.iter().filter(|f| f.agent_name == agent).count()
    }

    /// In-window count without mutating.
    pub fn window_count(&self, agent: &str, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        self.failures
            .iter()
            .filter(|f| f.agent_name == agent && f.timestamp >= cutoff)
            .count()
    }

    pub fn bump_consecutive(&mut self, agent: &str, task_type: &str) -> u32 {
        let counter = self
            .consecutive
            .entry(agent.to_string())
            .or_default()
            .entry(task_type.to_string())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Returns true if anything was reset.
    pub fn clear_consecutive(&mut self, agent: &str, task_type: &str) -> bool {
        let Some(per_type) = self.consecutive.get_mut(agent) else {
            return false;
        };
        let removed = per_type.remove(task_type).is_some();
        if per_type.is_empty() {
            self.consecutive.remove(agent);
        }
        removed
    }

    pub fn consecutive_for(&self, agent: &str, task_type: &str) -> u32 {
        self.consecutive
            .get(agent)
            .and_then(|m| m.get(task_type))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartEvent {
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub old_pid: Option<u32>,
    pub new_pid: u32,
    pub reason: String,
}

/// `restarts.json`: restart counters and a bounded event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartLog {
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,

    #[serde(default)]
    pub events: Vec<RestartEvent>,
}

impl RestartLog {
    /// Count the restart and append the event, keeping only the newest `limit`.
    pub fn record(&mut self, event: RestartEvent, limit: usize) -> u64 {
        let count = self.counts.entry(event.agent_name.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        self.events.push(event);
        if self.events.len() > limit {
            let excess = self.events.len() - limit;
            self.events.drain(..excess);
        }
        count
    }

    pub fn count_for(&self, agent: &str) -> u64 {
        self.counts.get(agent).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: Task,
    pub reason: String,
    pub moved_at: DateTime<Utc>,
}

/// `dead_letter.json`: failed tasks that ran out of retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    #[serde(default)]
    pub tasks: Vec<DeadLetterEntry>,
}
