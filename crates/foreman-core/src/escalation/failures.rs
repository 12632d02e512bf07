//! Failure tracking and escalation to debug tasks.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{FailureRecord, NewTask, PendingEscalation, Task, TaskId};
use crate::error::StoreError;
use crate::ports::Clock;
use crate::store::FailureStore;

pub const DEBUG_TASK_TYPE: &str = "debug";
pub const DEBUG_TASK_PRIORITY: u8 = 9;

/// Which failure count escalates.
///
/// - `Window`: failures of an agent within the sliding window
/// - `Consecutive`: back-to-back failures of one task type on one agent
/// - `Both`: either one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationTrigger {
    #[default]
    Window,
    Consecutive,
    Both,
}

impl FromStr for EscalationTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "window" => Ok(Self::Window),
            "consecutive" => Ok(Self::Consecutive),
            "both" => Ok(Self::Both),
            other => Err(format!("expected window, consecutive or both, got '{other}'")),
        }
    }
}

impl fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Window => "window",
            Self::Consecutive => "consecutive",
            Self::Both => "both",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationPolicy {
    pub trigger: EscalationTrigger,
    pub threshold: u32,
    pub window: Duration,
    /// Debug tasks are pre-assigned here; its own failures never escalate.
    pub debug_agent: String,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            trigger: EscalationTrigger::Window,
            threshold: 3,
            window: Duration::hours(1),
            debug_agent: "debug-agent".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    /// Failures of the agent still inside the window, this one included.
    pub window_count: usize,
    /// Consecutive failures of this task type on the agent, this one included.
    pub consecutive: u32,
    /// This failure crossed the threshold; one debug task is due.
    pub escalate: bool,
}

pub struct FailureTracker {
    store: Arc<FailureStore>,
    clock: Arc<dyn Clock>,
    policy: EscalationPolicy,
}

impl FailureTracker {
    pub fn new(store: Arc<FailureStore>, clock: Arc<dyn Clock>, policy: EscalationPolicy) -> Self {
        Self { store, clock, policy }
    }

    /// Append a failure for `agent` and decide whether it escalates.
    ///
    /// The window trigger fires only when the count goes from below the
    /// threshold to at or above it, so a fourth or fifth failure in the same
    /// hour does not create more debug tasks. Escalating resets the agent's
    /// consecutive counters; the window history is left alone.
    pub fn record_failure(&self, agent: &str, task_type: &str) -> Result<FailureReport, StoreError> {
        self.record(agent, task_type, |_, _| None)
    }

    /// `record_failure` for a finished task. A crossing also leaves a
    /// `PendingEscalation` for `debug_task_id` in the same write, so the debug
    /// task stays owed even if enqueueing it fails afterwards.
    pub fn record_task_failure(
        &self,
        agent: &str,
        failed: &Task,
        debug_task_id: &TaskId,
    ) -> Result<FailureReport, StoreError> {
        self.record(agent, &failed.task_type, |report, now| {
            Some(PendingEscalation {
                debug_task_id: debug_task_id.clone(),
                agent_name: agent.to_string(),
                description: self.describe(agent, failed, report),
                raised_at: now,
            })
        })
    }

    fn record(
        &self,
        agent: &str,
        task_type: &str,
        owed: impl Fn(&FailureReport, DateTime<Utc>) -> Option<PendingEscalation>,
    ) -> Result<FailureReport, StoreError> {
        let now = self.clock.now();
        let threshold = self.policy.threshold as usize;
        let trigger = self.policy.trigger;
        let window = self.policy.window;
        let exempt = agent == self.policy.debug_agent;

        self.store.save(|log| {
            let before = log.prune(agent, now, window);
            log.failures.push(FailureRecord {
                agent_name: agent.to_string(),
                timestamp: now,
            });
            let window_count = before + 1;
            let consecutive = log.bump_consecutive(agent, task_type);

            let window_hit = matches!(trigger, EscalationTrigger::Window | EscalationTrigger::Both)
                && before < threshold
                && window_count >= threshold;
            let consecutive_hit = matches!(trigger, EscalationTrigger::Consecutive | EscalationTrigger::Both)
                && consecutive as usize >= threshold;
            let escalate = (window_hit || consecutive_hit) && !exempt;
            let report = FailureReport {
                window_count,
                consecutive,
                escalate,
            };
            if escalate {
                log.consecutive.remove(agent);
                log.pending.extend(owed(&report, now));
            }
            debug!(agent, task_type, window_count, consecutive, escalate, "failure recorded");
            report
        })
    }

    /// A success breaks the consecutive run for that task type.
    pub fn record_success(&self, agent: &str, task_type: &str) -> Result<(), StoreError> {
        self.store.save(|log| {
            log.clear_consecutive(agent, task_type);
        })
    }

    /// Lock-free in-window count.
    pub fn window_count(&self, agent: &str) -> usize {
        self.store
            .load()
            .window_count(agent, self.clock.now(), self.policy.window)
    }

    /// Crossings whose debug task may not be enqueued yet, oldest first.
    pub fn pending(&self) -> Vec<PendingEscalation> {
        self.store.load().pending
    }

    /// Forget the crossing behind `debug_task_id`; its task is enqueued.
    pub fn settle(&self, debug_task_id: &TaskId) -> Result<(), StoreError> {
        self.store.save(|log| {
            log.pending.retain(|p| &p.debug_task_id != debug_task_id);
        })
    }

    /// The follow-up task owed for `pending`. Its id is fixed, so enqueueing
    /// it twice yields one task.
    pub fn debug_task(&self, pending: &PendingEscalation) -> NewTask {
        NewTask::new(DEBUG_TASK_TYPE, pending.description.clone())
            .with_id(pending.debug_task_id.clone())
            .priority(DEBUG_TASK_PRIORITY)
            .assigned_to(self.policy.debug_agent.clone())
    }

    fn describe(&self, agent: &str, failed: &Task, report: &FailureReport) -> String {
        let mut description = format!(
            "Investigate repeated failures of agent '{agent}': task {} (type '{}') failed; \
             {} failure(s) in the last {} min, {} consecutive for this type.",
            failed.id,
            failed.task_type,
            report.window_count,
            self.policy.window.num_minutes(),
            report.consecutive,
        );
        if let Some(notes) = failed.notes.as_deref().filter(|n| !n.is_empty()) {
            description.push_str(" Last notes: ");
            description.push_str(notes);
        }
        description
    }
}
