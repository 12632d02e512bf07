//! Status - キューと agent のサマリ
//!
//! Plain data built from one snapshot of each document. `Display` renders
//! the human table; `Serialize` backs `--json`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AgentRecord, TaskId, TaskList, TaskStatus};
use crate::queue::DependencyGraph;
use crate::supervisor::Verdict;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.queued + self.assigned + self.in_progress + self.completed + self.failed
    }

    fn bump(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Assigned => self.assigned += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub id: TaskId,
    pub waiting_on: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRow {
    pub name: String,
    /// Self-reported status, or `unregistered`.
    pub status: String,
    pub alive: bool,
    pub liveness: String,
    pub pid: Option<u32>,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub restarts: u64,
    pub last_seen_secs: Option<i64>,
}

impl AgentRow {
    pub fn new(
        name: &str,
        record: Option<&AgentRecord>,
        verdict: &Verdict,
        restarts: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.to_string(),
            status: record.map_or_else(|| "unregistered".to_string(), |r| r.status.to_string()),
            alive: verdict.is_alive(),
            liveness: verdict.to_string(),
            pid: record.and_then(AgentRecord::live_pid),
            current_task: record.and_then(|r| r.current_task.clone()),
            tasks_completed: record.map_or(0, |r| r.tasks_completed),
            restarts,
            last_seen_secs: record.map(|r| (now - r.last_seen).num_seconds().max(0)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    pub counts: QueueCounts,
    /// Open (non-terminal) tasks per assigned agent, or `unassigned`.
    pub distribution: BTreeMap<String, usize>,
    pub blocked: Vec<BlockedTask>,
    pub throttled: usize,
    pub dead_letter: usize,
    pub agents: Vec<AgentRow>,
}

impl FleetStatus {
    pub fn summarize(tasks: &TaskList, dead_letter: usize, agents: Vec<AgentRow>) -> Self {
        let graph = DependencyGraph::from_tasks(tasks.tasks.iter());
        let mut status = FleetStatus {
            dead_letter,
            agents,
            ..FleetStatus::default()
        };

        for task in &tasks.tasks {
            status.counts.bump(task.status);
            if task.status.is_terminal() {
                continue;
            }
            let owner = task.assigned_agent.as_deref().unwrap_or("unassigned");
            *status.distribution.entry(owner.to_string()).or_insert(0) += 1;
            if task.throttled {
                status.throttled += 1;
            }
            if task.status == TaskStatus::Queued {
                let waiting_on = graph.unmet_dependencies(&task.id);
                if !waiting_on.is_empty() {
                    status.blocked.push(BlockedTask {
                        id: task.id.clone(),
                        waiting_on,
                    });
                }
            }
        }
        status
    }

    pub fn agent_names(&self) -> BTreeSet<&str> {
        self.agents.iter().map(|a| a.name.as_str()).collect()
    }
}

impl fmt::Display for FleetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(f, "Tasks ({} total)", c.total())?;
        writeln!(
            f,
            "  queued {}  assigned {}  in_progress {}  completed {}  failed {}",
            c.queued, c.assigned, c.in_progress, c.completed, c.failed
        )?;
        writeln!(f, "  throttled {}  dead letter {}", self.throttled, self.dead_letter)?;

        if !self.distribution.is_empty() {
            writeln!(f, "Open tasks by agent")?;
            for (agent, n) in &self.distribution {
                writeln!(f, "  {agent:<20} {n}")?;
            }
        }

        if !self.blocked.is_empty() {
            writeln!(f, "Blocked")?;
            for b in &self.blocked {
                let deps: Vec<&str> = b.waiting_on.iter().map(TaskId::as_str).collect();
                writeln!(f, "  {} waits on {}", b.id, deps.join(", "))?;
            }
        }

        writeln!(f, "Agents")?;
        write!(f, "{}", AgentTable(&self.agents))
    }
}

/// The agent table shared by `status` and `agents list`.
pub struct AgentTable<'a>(pub &'a [AgentRow]);

impl fmt::Display for AgentTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return writeln!(f, "  (none)");
        }
        writeln!(
            f,
            "  {:<20} {:<12} {:<28} {:>8} {:<32} {:>6} {:>8} {:>10}",
            "NAME", "STATUS", "LIVENESS", "PID", "TASK", "DONE", "RESTARTS", "LAST SEEN"
        )?;
        for row in self.0 {
            writeln!(
                f,
                "  {:<20} {:<12} {:<28} {:>8} {:<32} {:>6} {:>8} {:>10}",
                row.name,
                row.status,
                row.liveness,
                row.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                row.current_task.as_ref().map_or("-", TaskId::as_str),
                row.tasks_completed,
                row.restarts,
                row.last_seen_secs.map_or_else(|| "-".to_string(), |s| format!("{s}s")),
            )?;
        }
        Ok(())
    }
}
