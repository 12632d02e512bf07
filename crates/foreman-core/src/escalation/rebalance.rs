//! Workload rebalancing.
//!
//! Periodically hands stuck work back to the queue:
//! - every `in_progress` task of an agent that is not alive
//! - the excess of an agent with more than `overload_threshold` tasks
//!   `in_progress`, most recently claimed first
//! - `failed` tasks that still have retries left
//!
//! Failed tasks out of retries go to the dead letter instead.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::domain::{Task, TaskId, TaskStatus};
use crate::error::DispatchError;
use crate::queue::Dispatcher;
use crate::supervisor::AgentSupervisor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueReason {
    DeadAgent(String),
    Overloaded(String),
    Retry,
}

impl fmt::Display for RequeueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequeueReason::DeadAgent(agent) => write!(f, "owner {agent} is dead"),
            RequeueReason::Overloaded(agent) => write!(f, "owner {agent} is overloaded"),
            RequeueReason::Retry => f.write_str("retry after failure"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalanceReport {
    pub requeued: Vec<(TaskId, RequeueReason)>,
    pub abandoned: Vec<TaskId>,
    /// Debug tasks of earlier threshold crossings that were still owed.
    pub escalated: Vec<TaskId>,
}

/// Decide what to requeue. `alive` holds the names of live agents.
pub fn plan(
    tasks: &[Task],
    alive: &BTreeSet<String>,
    overload_threshold: usize,
) -> Vec<(TaskId, RequeueReason)> {
    let mut by_agent: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
    for task in tasks.iter().filter(|t| t.status == TaskStatus::InProgress) {
        // an in_progress task with no owner has nobody to finish it
        let owner = task.assigned_agent.as_deref().unwrap_or("");
        by_agent.entry(owner).or_default().push(task);
    }

    let mut picked = Vec::new();
    for (agent, mut owned) in by_agent {
        if !alive.contains(agent) {
            picked.extend(
                owned
                    .into_iter()
                    .map(|t| (t.id.clone(), RequeueReason::DeadAgent(agent.to_string()))),
            );
            continue;
        }
        if owned.len() > overload_threshold {
            let excess = owned.len() - overload_threshold;
            owned.sort_by(|a, b| b.last_touched().cmp(&a.last_touched()).then_with(|| b.id.cmp(&a.id)));
            picked.extend(
                owned
                    .into_iter()
                    .take(excess)
                    .map(|t| (t.id.clone(), RequeueReason::Overloaded(agent.to_string()))),
            );
        }
    }

    picked.extend(
        tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed && !t.retries_exhausted())
            .map(|t| (t.id.clone(), RequeueReason::Retry)),
    );
    picked
}

pub struct Rebalancer {
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<AgentSupervisor>,
    overload_threshold: usize,
}

impl Rebalancer {
    pub fn new(dispatcher: Arc<Dispatcher>, supervisor: Arc<AgentSupervisor>, overload_threshold: usize) -> Self {
        Self {
            dispatcher,
            supervisor,
            overload_threshold,
        }
    }

    pub fn run(&self) -> Result<RebalanceReport, DispatchError> {
        let alive: BTreeSet<String> = self
            .supervisor
            .registry()
            .list()
            .into_iter()
            .filter(|r| self.supervisor.liveness().is_alive(r))
            .map(|r| r.name)
            .collect();

        let threshold = self.overload_threshold;
        let requeued = self
            .dispatcher
            .requeue_where(|tasks| plan(tasks, &alive, threshold))?;
        for (id, reason) in &requeued {
            info!(task_id = %id, %reason, "rebalanced");
        }
        let abandoned = self.dispatcher.abandon_exhausted()?;
        let escalated = self.dispatcher.drain_escalations();

        if !requeued.is_empty() || !abandoned.is_empty() || !escalated.is_empty() {
            info!(
                requeued = requeued.len(),
                abandoned = abandoned.len(),
                escalated = escalated.len(),
                "rebalance finished"
            );
        }
        Ok(RebalanceReport {
            requeued,
            abandoned,
            escalated,
        })
    }
}
