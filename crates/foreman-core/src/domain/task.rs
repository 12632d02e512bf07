//! Task model and the task status machine.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task status.
///
/// State transitions:
/// - queued -> assigned -> in_progress -> completed
/// - queued -> in_progress -> failed
/// - failed -> queued (requeue only, done by the rebalancer)
///
/// Status only moves forward; `completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Assigned => 1,
            TaskStatus::InProgress => 2,
            TaskStatus::Completed | TaskStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Owned by an agent and not finished.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    /// Forward moves only. Requeue is not a forward move and is handled by
    /// `Task::requeue`.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// A unit of work as persisted in `tasks.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Key selecting the external executor.
    #[serde(rename = "type")]
    pub task_type: String,

    /// Free text, opaque to the coordinator.
    #[serde(default)]
    pub description: String,

    /// 1..=10, higher is more urgent.
    pub priority: u8,

    pub status: TaskStatus,

    #[serde(default)]
    pub assigned_agent: Option<String>,

    /// Tasks that must be `completed` before this one is claimable.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,

    pub created_at: DateTime<Utc>,

    /// Set by backpressure when a claim was deferred.
    #[serde(default)]
    pub throttled: bool,

    /// Requeues out of `failed` so far.
    #[serde(default)]
    pub retries: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Executor outcome notes from the last report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Claimable by `agent` if queued and either unassigned or pre-assigned to
    /// it, or explicitly `assigned` to it. Dependencies are checked separately.
    pub fn is_claimable_by(&self, agent: &str) -> bool {
        let owner_ok = match self.assigned_agent.as_deref() {
            None => true,
            Some(owner) => owner == agent,
        };
        match self.status {
            TaskStatus::Queued => owner_ok,
            TaskStatus::Assigned => self.assigned_agent.as_deref() == Some(agent),
            _ => false,
        }
    }

    pub fn claim(&mut self, agent: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.assigned_agent = Some(agent.to_string());
        self.throttled = false;
        self.updated_at = Some(now);
    }

    pub fn finish(&mut self, success: bool, notes: Option<String>, now: DateTime<Utc>) {
        self.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.notes = notes;
        self.updated_at = Some(now);
    }

    /// Back to `queued` with no owner. Dependencies and priority are untouched.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        if self.status == TaskStatus::Failed {
            self.retries += 1;
        }
        self.status = TaskStatus::Queued;
        self.assigned_agent = None;
        self.throttled = false;
        self.updated_at = Some(now);
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    /// Most recent modification time, falling back to creation.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

/// Input for `Dispatcher::enqueue`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Option<TaskId>,
    pub task_type: String,
    pub description: String,
    pub priority: u8,
    pub assigned_agent: Option<String>,
    pub dependencies: BTreeSet<TaskId>,
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            description: description.into(),
            priority: 5,
            assigned_agent: None,
            dependencies: BTreeSet::new(),
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn assigned_to(mut self, agent: impl Into<String>) -> Self {
        self.assigned_agent = Some(agent.into());
        self
    }

    pub fn depends_on<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// The task document (`tasks.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl TaskList {
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.get(id).is_some()
    }

    /// Collapse duplicate ids, keeping the most recently touched copy in the
    /// position of its first occurrence. Returns how many were dropped.
    pub fn dedupe(&mut self) -> usize {
        let before = self.tasks.len();
        let mut kept: Vec<Task> = Vec::with_capacity(before);
        for task in self.tasks.drain(..) {
            match kept.iter_mut().find(|k| k.id == task.id) {
                Some(existing) => {
                    if task.last_touched() >= existing.last_touched() {
                        *existing = task;
                    }
                }
                None => kept.push(task),
            }
        }
        self.tasks = kept;
        before - self.tasks.len()
    }
}
