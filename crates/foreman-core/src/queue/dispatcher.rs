//! Dispatcher - claim protocol と task の状態遷移
//!
//! Every operation that changes a task is one read-modify-write of the task
//! document under its lock. In particular a claim reads the current status,
//! checks it is still claimable, and writes `in_progress` in the same lock
//! acquisition, so two workers can never both receive one task.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::domain::{DeadLetterEntry, NewTask, Task, TaskId, TaskList, TaskStatus};
use crate::error::DispatchError;
use crate::escalation::FailureTracker;
use crate::ports::{Clock, IdGenerator};
use crate::queue::DependencyGraph;
use crate::store::{DeadLetterStore, TaskStore};

pub const PRIORITY_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

/// Result of `Dispatcher::report_outcome`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reported {
    pub task: Task,
    /// Debug task created because this failure crossed the escalation threshold.
    pub debug_task: Option<TaskId>,
}

pub struct Dispatcher {
    tasks: Arc<TaskStore>,
    dead_letter: Arc<DeadLetterStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    escalation: Option<Arc<FailureTracker>>,
    max_retries: u32,
    keep_finished: usize,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<TaskStore>,
        dead_letter: Arc<DeadLetterStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks,
            dead_letter,
            ids,
            clock,
            escalation: None,
            max_retries: crate::domain::DEFAULT_MAX_RETRIES,
            keep_finished: 500,
        }
    }

    /// Failures reported through this dispatcher feed `tracker`.
    pub fn with_escalation(mut self, tracker: Arc<FailureTracker>) -> Self {
        self.escalation = Some(tracker);
        self
    }

    /// Default `max_retries` for tasks enqueued without one.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// How many completed tasks to keep after an outcome is reported.
    pub fn with_keep_finished(mut self, keep_finished: usize) -> Self {
        self.keep_finished = keep_finished;
        self
    }

    /// Lock-free view of the task list, duplicates collapsed.
    pub fn snapshot(&self) -> TaskList {
        let mut list = self.tasks.load();
        list.dedupe();
        list
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.snapshot().get(id).cloned()
    }

    /// Add a task and return its id.
    ///
    /// - priority must be within 1..=10
    /// - every dependency must already exist
    /// - an explicit id that already exists is not enqueued twice; the existing
    ///   id is returned
    pub fn enqueue(&self, new: NewTask) -> Result<TaskId, DispatchError> {
        if !PRIORITY_RANGE.contains(&new.priority) {
            return Err(DispatchError::InvalidPriority(new.priority));
        }
        let explicit = new.id.is_some();
        let id = new.id.clone().unwrap_or_else(|| self.ids.generate_task_id());
        let now = self.clock.now();
        let max_retries = new.max_retries.unwrap_or(self.max_retries);

        let inserted = self.tasks.try_update(|list| {
            normalise(list);
            if list.contains(&id) {
                return Ok(false);
            }
            if let Some(missing) = new.dependencies.iter().find(|d| !list.contains(d)) {
                return Err(DispatchError::UnknownDependency(missing.clone()));
            }
            list.tasks.push(Task {
                id: id.clone(),
                task_type: new.task_type.clone(),
                description: new.description.clone(),
                priority: new.priority,
                status: TaskStatus::Queued,
                assigned_agent: new.assigned_agent.clone(),
                dependencies: new.dependencies.clone(),
                created_at: now,
                throttled: false,
                retries: 0,
                max_retries,
                notes: None,
                updated_at: Some(now),
            });
            list.last_updated = Some(now);
            Ok(true)
        })?;

        if inserted {
            info!(task_id = %id, task_type = %new.task_type, priority = new.priority, "task enqueued");
        } else if explicit {
            debug!(task_id = %id, "task already exists, enqueue skipped");
        }
        Ok(id)
    }

    /// Claim the best task `agent` may take, of any type.
    pub fn next_claimable(&self, agent: &str) -> Result<Option<Task>, DispatchError> {
        self.next_claimable_matching(agent, |_| true)
    }

    /// Claim the best task `agent` may take among types accepted by `accepts`.
    ///
    /// Best means highest priority, then earliest `created_at`. `None` means
    /// there is nothing to do right now.
    pub fn next_claimable_matching(
        &self,
        agent: &str,
        accepts: impl Fn(&str) -> bool,
    ) -> Result<Option<Task>, DispatchError> {
        let now = self.clock.now();
        let claimed = self.tasks.try_update(|list| {
            normalise(list);
            let Some(idx) = select(list, agent, &accepts) else {
                return Ok::<_, DispatchError>(None);
            };
            let task = &mut list.tasks[idx];
            task.claim(agent, now);
            let claimed = task.clone();
            list.last_updated = Some(now);
            Ok(Some(claimed))
        })?;

        if let Some(task) = &claimed {
            info!(task_id = %task.id, agent, priority = task.priority, "task claimed");
        }
        Ok(claimed)
    }

    /// Backpressure deferred a claim: flag the task `agent` would have taken.
    pub fn defer(&self, agent: &str, accepts: impl Fn(&str) -> bool) -> Result<Option<TaskId>, DispatchError> {
        let now = self.clock.now();
        let deferred = self.tasks.try_update(|list| {
            normalise(list);
            let Some(idx) = select(list, agent, &accepts) else {
                return Ok::<_, DispatchError>(None);
            };
            let task = &mut list.tasks[idx];
            if !task.throttled {
                task.throttled = true;
                task.updated_at = Some(now);
            }
            Ok(Some(task.id.clone()))
        })?;
        if let Some(id) = &deferred {
            debug!(task_id = %id, agent, "claim deferred by backpressure");
        }
        Ok(deferred)
    }

    /// Record the executor's verdict, as reported by `agent`.
    ///
    /// Only a task that is `assigned` or `in_progress` and owned by `agent`
    /// can finish, so a late report from an earlier owner cannot close a
    /// re-claimed task. Failures are handed to the failure tracker after the
    /// task write; escalation problems are logged, never returned, since the
    /// outcome itself is already durable.
    pub fn report_outcome(
        &self,
        id: &TaskId,
        agent: &str,
        success: bool,
        notes: Option<String>,
    ) -> Result<Reported, DispatchError> {
        let now = self.clock.now();
        let keep = self.keep_finished;
        let target = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        let task = self.tasks.try_update(|list| {
            normalise(list);
            let task = list
                .get_mut(id)
                .ok_or_else(|| DispatchError::NotFound(id.clone()))?;
            if !task.status.is_in_flight() || !task.status.can_advance_to(target) {
                return Err(DispatchError::InvalidTransition {
                    id: id.clone(),
                    from: task.status,
                    to: target,
                });
            }
            if task.assigned_agent.as_deref() != Some(agent) {
                return Err(DispatchError::NotOwner {
                    id: id.clone(),
                    agent: agent.to_string(),
                    owner: task.assigned_agent.clone(),
                });
            }
            task.finish(success, notes.clone(), now);
            let finished = task.clone();
            let pruned = prune_completed(list, keep);
            if pruned > 0 {
                debug!(pruned, "pruned old completed tasks");
            }
            list.last_updated = Some(now);
            Ok(finished)
        })?;

        info!(task_id = %id, status = %task.status, agent, "task outcome recorded");
        let debug_task = self.escalate(&task, agent, success);
        Ok(Reported { task, debug_task })
    }

    fn escalate(&self, task: &Task, agent: &str, success: bool) -> Option<TaskId> {
        let tracker = self.escalation.as_ref()?;
        if success {
            if let Err(e) = tracker.record_success(agent, &task.task_type) {
                warn!(agent, error = %e, "failed to reset consecutive failure counter");
            }
            self.drain_escalations();
            return None;
        }

        let debug_id = self.ids.generate_task_id();
        let report = match tracker.record_task_failure(agent, task, &debug_id) {
            Ok(report) => report,
            Err(e) => {
                error!(agent, task_id = %task.id, error = %e, "failed to record failure");
                return None;
            }
        };
        let enqueued = self.drain_escalations();
        if !report.escalate {
            return None;
        }
        if enqueued.contains(&debug_id) {
            warn!(agent, debug_task = %debug_id, window_count = report.window_count, consecutive = report.consecutive, "failure threshold crossed, debug task enqueued");
            Some(debug_id)
        } else {
            warn!(agent, debug_task = %debug_id, "failure threshold crossed, debug task still pending");
            None
        }
    }

    /// Enqueue the debug task of every crossing still owed one.
    ///
    /// A crossing is forgotten only after its task is in the list, and the
    /// task id is fixed at crossing time, so a crossing yields exactly one
    /// debug task however often this runs. Returns the ids enqueued now.
    pub fn drain_escalations(&self) -> Vec<TaskId> {
        let Some(tracker) = self.escalation.as_ref() else {
            return Vec::new();
        };
        let mut enqueued = Vec::new();
        for pending in tracker.pending() {
            match self.enqueue(tracker.debug_task(&pending)) {
                Ok(id) => {
                    if let Err(e) = tracker.settle(&id) {
                        warn!(debug_task = %id, error = %e, "debug task enqueued but crossing not settled");
                    }
                    enqueued.push(id);
                }
                Err(e) => {
                    error!(agent = %pending.agent_name, debug_task = %pending.debug_task_id, error = %e, "failed to enqueue debug task, will retry");
                }
            }
        }
        enqueued
    }

    /// Reset a task to `queued` with no owner.
    ///
    /// Returns `Ok(false)` if it already was queued. A completed task cannot
    /// be requeued.
    pub fn requeue(&self, id: &TaskId) -> Result<bool, DispatchError> {
        let now = self.clock.now();
        let changed = self.tasks.try_update(|list| {
            normalise(list);
            let task = list
                .get_mut(id)
                .ok_or_else(|| DispatchError::NotFound(id.clone()))?;
            match task.status {
                TaskStatus::Queued => Ok(false),
                TaskStatus::Completed => Err(DispatchError::InvalidTransition {
                    id: id.clone(),
                    from: TaskStatus::Completed,
                    to: TaskStatus::Queued,
                }),
                _ => {
                    task.requeue(now);
                    list.last_updated = Some(now);
                    Ok(true)
                }
            }
        })?;
        if changed {
            info!(task_id = %id, "task requeued");
        }
        Ok(changed)
    }

    /// Requeue whatever `plan` picks from the current list, in one lock
    /// acquisition. Picked tasks that are queued or completed are skipped.
    pub fn requeue_where<R: Clone>(
        &self,
        plan: impl Fn(&[Task]) -> Vec<(TaskId, R)>,
    ) -> Result<Vec<(TaskId, R)>, DispatchError> {
        let now = self.clock.now();
        let requeued = self.tasks.try_update(|list| {
            normalise(list);
            let mut done = Vec::new();
            for (id, reason) in plan(&list.tasks) {
                let Some(task) = list.get_mut(&id) else {
                    continue;
                };
                if matches!(task.status, TaskStatus::Queued | TaskStatus::Completed) {
                    continue;
                }
                task.requeue(now);
                done.push((id, reason));
            }
            if !done.is_empty() {
                list.last_updated = Some(now);
            }
            Ok::<_, DispatchError>(done)
        })?;
        for (id, _) in &requeued {
            info!(task_id = %id, "task requeued");
        }
        Ok(requeued)
    }

    /// Move failed tasks that used up their retries to the dead letter.
    ///
    /// The entry is written to the dead letter before the task leaves the
    /// list, so a crash in between leaves a duplicate rather than a loss.
    pub fn abandon_exhausted(&self) -> Result<Vec<TaskId>, DispatchError> {
        let now = self.clock.now();
        let exhausted: Vec<Task> = self
            .snapshot()
            .tasks
            .into_iter()
            .filter(is_exhausted)
            .collect();
        if exhausted.is_empty() {
            return Ok(Vec::new());
        }

        self.dead_letter.save(|dl| {
            for task in &exhausted {
                if dl.tasks.iter().any(|e| e.task.id == task.id) {
                    continue;
                }
                dl.tasks.push(DeadLetterEntry {
                    task: task.clone(),
                    reason: format!("retries exhausted ({}/{})", task.retries, task.max_retries),
                    moved_at: now,
                });
            }
        })?;

        let removed = self.tasks.try_update(|list| {
            normalise(list);
            let mut removed = Vec::new();
            list.tasks.retain(|t| {
                let moved = is_exhausted(t) && exhausted.iter().any(|e| e.id == t.id);
                if moved {
                    removed.push(t.id.clone());
                }
                !moved
            });
            if !removed.is_empty() {
                list.last_updated = Some(now);
            }
            Ok::<_, DispatchError>(removed)
        })?;
        for id in &removed {
            warn!(task_id = %id, "task moved to dead letter");
        }
        Ok(removed)
    }
}

fn is_exhausted(task: &Task) -> bool {
    task.status == TaskStatus::Failed && task.retries_exhausted()
}

fn normalise(list: &mut TaskList) {
    let dropped = list.dedupe();
    if dropped > 0 {
        warn!(dropped, "collapsed duplicate task ids");
    }
}

/// Index of the task `agent` should get next, if any.
fn select(list: &TaskList, agent: &str, accepts: &impl Fn(&str) -> bool) -> Option<usize> {
    let graph = DependencyGraph::from_tasks(&list.tasks);
    list.tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_claimable_by(agent) && accepts(&t.task_type) && graph.is_satisfied(&t.id))
        .min_by(|(_, a), (_, b)| claim_order(a, b))
        .map(|(idx, _)| idx)
}

fn claim_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Drop the oldest completed tasks beyond `keep`, sparing any that an
/// unfinished task still depends on. Returns how many were dropped.
fn prune_completed(list: &mut TaskList, keep: usize) -> usize {
    let mut completed: Vec<(DateTime<Utc>, TaskId)> = list
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| (t.last_touched(), t.id.clone()))
        .collect();
    if completed.len() <= keep {
        return 0;
    }
    completed.sort();
    let graph = DependencyGraph::from_tasks(&list.tasks);
    let excess = completed.len() - keep;
    let doomed: Vec<TaskId> = completed
        .into_iter()
        .map(|(_, id)| id)
        .filter(|id| !graph.has_pending_dependents(id))
        .take(excess)
        .collect();
    list.tasks.retain(|t| !doomed.contains(&t.id));
    doomed.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::store::Stores;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        _dir: TempDir,
        clock: Arc<FixedClock>,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let stores = Stores::open(dir.path(), Duration::from_millis(500));
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let dispatcher = Dispatcher::new(
            stores.tasks.clone(),
            stores.dead_letter.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock.clone(),
        );
        Harness {
            _dir: dir,
            clock,
            dispatcher,
        }
    }

    impl Harness {
        fn enqueue(&self, id: &str, priority: u8, deps: &[&str]) -> TaskId {
            self.clock.advance(ChronoDuration::seconds(1));
            self.dispatcher
                .enqueue(
                    NewTask::new("build", format!("task {id}"))
                        .with_id(id)
                        .priority(priority)
                        .depends_on(deps.iter().copied()),
                )
                .unwrap()
        }

        fn claim(&self, agent: &str) -> Option<String> {
            self.dispatcher
                .next_claimable(agent)
                .unwrap()
                .map(|t| t.id.as_str().to_string())
        }
    }

    #[test]
    fn generated_ids_are_unique_and_tasks_start_queued() {
        let h = harness();
        let a = h.dispatcher.enqueue(NewTask::new("build", "a")).unwrap();
        let b = h.dispatcher.enqueue(NewTask::new("build", "b")).unwrap();
        assert_ne!(a, b);
        let task = h.dispatcher.get(&a).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.max_retries, crate::domain::DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn highest_priority_then_oldest_is_claimed_first() {
        let h = harness();
        h.enqueue("old-low", 5, &[]);
        h.enqueue("high", 8, &[]);
        h.enqueue("new-low", 5, &[]);

        assert_eq!(h.claim("a").as_deref(), Some("high"));
        assert_eq!(h.claim("a").as_deref(), Some("old-low"));
        assert_eq!(h.claim("a").as_deref(), Some("new-low"));
        assert_eq!(h.claim("a"), None);
    }

    #[test]
    fn claimed_task_is_in_progress_and_owned() {
        let h = harness();
        h.enqueue("t1", 5, &[]);
        h.claim("agent-a");
        let t = h.dispatcher.get(&TaskId::from("t1")).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(t.assigned_agent.as_deref(), Some("agent-a"));
    }

    #[test]
    fn unmet_dependency_blocks_until_completed() {
        let h = harness();
        let t1 = h.enqueue("t1", 5, &[]);
        h.enqueue("t3", 10, &["t1"]);

        assert_eq!(h.claim("a").as_deref(), Some("t1"));
        assert_eq!(h.claim("b"), None);

        h.dispatcher.report_outcome(&t1, "a", true, None).unwrap();
        assert_eq!(h.claim("b").as_deref(), Some("t3"));
    }

    #[test]
    fn failed_dependency_keeps_dependent_blocked() {
        let h = harness();
        let t1 = h.enqueue("t1", 5, &[]);
        h.enqueue("t2", 5, &["t1"]);
        h.claim("a");
        h.dispatcher.report_outcome(&t1, "a", false, Some("boom".into())).unwrap();
        assert_eq!(h.claim("a"), None);
    }

    #[test]
    fn pre_assigned_task_is_reserved_for_its_agent() {
        let h = harness();
        h.dispatcher
            .enqueue(NewTask::new("debug", "look").with_id("d1").priority(9).assigned_to("debug-agent"))
            .unwrap();
        assert_eq!(h.claim("build-agent"), None);
        assert_eq!(h.claim("debug-agent").as_deref(), Some("d1"));
    }

    #[test]
    fn claim_can_be_filtered_by_task_type() {
        let h = harness();
        h.enqueue("b1", 9, &[]);
        h.dispatcher
            .enqueue(NewTask::new("docs", "write").with_id("d1").priority(2))
            .unwrap();

        let got = h
            .dispatcher
            .next_claimable_matching("writer", |ty| ty == "docs")
            .unwrap()
            .unwrap();
        assert_eq!(got.id, TaskId::from("d1"));
    }

    #[test]
    fn enqueue_rejects_bad_priority_and_unknown_dependencies() {
        let h = harness();
        assert!(matches!(
            h.dispatcher.enqueue(NewTask::new("build", "x").priority(0)),
            Err(DispatchError::InvalidPriority(0))
        ));
        assert!(matches!(
            h.dispatcher.enqueue(NewTask::new("build", "x").priority(11)),
            Err(DispatchError::InvalidPriority(11))
        ));
        assert!(matches!(
            h.dispatcher.enqueue(NewTask::new("build", "x").depends_on(["ghost"])),
            Err(DispatchError::UnknownDependency(id)) if id == TaskId::from("ghost")
        ));
        assert!(h.dispatcher.snapshot().tasks.is_empty());
    }

    #[test]
    fn explicit_duplicate_id_is_not_enqueued_twice() {
        let h = harness();
        h.enqueue("t1", 5, &[]);
        let again = h
            .dispatcher
            .enqueue(NewTask::new("other", "changed").with_id("t1").priority(9))
            .unwrap();
        assert_eq!(again, TaskId::from("t1"));
        let list = h.dispatcher.snapshot();
        assert_eq!(list.tasks.len(), 1);
        assert_eq!(list.tasks[0].priority, 5);
    }

    #[test]
    fn outcome_requires_an_in_flight_task() {
        let h = harness();
        let t1 = h.enqueue("t1", 5, &[]);
        assert!(matches!(
            h.dispatcher.report_outcome(&t1, "a", true, None),
            Err(DispatchError::InvalidTransition { from: TaskStatus::Queued, .. })
        ));

        h.claim("a");
        assert!(matches!(
            h.dispatcher.report_outcome(&t1, "b", true, None),
            Err(DispatchError::NotOwner { owner: Some(ref o), .. }) if o == "a"
        ));
        let reported = h.dispatcher.report_outcome(&t1, "a", true, Some("ok".into())).unwrap();
        assert_eq!(reported.task.status, TaskStatus::Completed);
        assert_eq!(reported.task.notes.as_deref(), Some("ok"));

        assert!(matches!(
            h.dispatcher.report_outcome(&t1, "a", false, None),
            Err(DispatchError::InvalidTransition { from: TaskStatus::Completed, .. })
        ));
        assert!(matches!(
            h.dispatcher.report_outcome(&TaskId::from("nope"), "a", true, None),
            Err(DispatchError::NotFound(_))
        ));
    }

    #[test]
    fn requeue_is_idempotent_and_refuses_completed() {
        let h = harness();
        let t1 = h.enqueue("t1", 7, &[]);
        assert!(!h.dispatcher.requeue(&t1).unwrap());

        h.claim("a");
        assert!(h.dispatcher.requeue(&t1).unwrap());
        let t = h.dispatcher.get(&t1).unwrap();
        assert_eq!(t.status, TaskStatus::Queued);
        assert_eq!(t.assigned_agent, None);
        assert_eq!(t.priority, 7);
        assert_eq!(t.retries, 0);

        h.claim("a");
        h.dispatcher.report_outcome(&t1, "a", true, None).unwrap();
        assert!(matches!(
            h.dispatcher.requeue(&t1),
            Err(DispatchError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn defer_flags_the_next_task_and_claim_clears_it() {
        let h = harness();
        let t1 = h.enqueue("t1", 5, &[]);
        assert_eq!(h.dispatcher.defer("a", |_| true).unwrap(), Some(t1.clone()));
        assert!(h.dispatcher.get(&t1).unwrap().throttled);

        h.claim("a");
        assert!(!h.dispatcher.get(&t1).unwrap().throttled);
    }

    #[test]
    fn exhausted_failures_move_to_dead_letter() {
        let h = harness();
        let t1 = h
            .dispatcher
            .enqueue(NewTask::new("build", "flaky").with_id("t1").max_retries(1))
            .unwrap();
        h.claim("a");
        h.dispatcher.report_outcome(&t1, "a", false, None).unwrap();
        assert!(h.dispatcher.abandon_exhausted().unwrap().is_empty());

        h.dispatcher.requeue(&t1).unwrap();
        h.claim("a");
        h.dispatcher.report_outcome(&t1, "a", false, None).unwrap();
        assert_eq!(h.dispatcher.abandon_exhausted().unwrap(), vec![t1.clone()]);

        assert!(h.dispatcher.get(&t1).is_none());
        let dl = h.dispatcher.dead_letter.load();
        assert_eq!(dl.tasks.len(), 1);
        assert!(dl.tasks[0].reason.contains("1/1"));
    }

    #[test]
    fn pruning_spares_completed_tasks_with_pending_dependents() {
        let h = harness();
        let dispatcher = Dispatcher::new(
            h.dispatcher.tasks.clone(),
            h.dispatcher.dead_letter.clone(),
            h.dispatcher.ids.clone(),
            h.clock.clone(),
        )
        .with_keep_finished(1);

        let a = h.enqueue("a", 9, &[]);
        let b = h.enqueue("b", 8, &[]);
        h.enqueue("c", 1, &["a"]);

        dispatcher.next_claimable("w").unwrap();
        h.clock.advance(ChronoDuration::seconds(1));
        dispatcher.report_outcome(&a, "w", true, None).unwrap();
        dispatcher.next_claimable("w").unwrap();
        h.clock.advance(ChronoDuration::seconds(1));
        dispatcher.report_outcome(&b, "w", true, None).unwrap();

        // "a" is older but "c" still waits on it, so "b" goes instead
        let list = dispatcher.snapshot();
        assert!(list.contains(&a));
        assert!(!list.contains(&b));
    }

    #[test]
    fn pruning_spares_a_dependency_of_a_failed_task_that_will_retry() {
        let h = harness();
        let dispatcher = Dispatcher::new(
            h.dispatcher.tasks.clone(),
            h.dispatcher.dead_letter.clone(),
            h.dispatcher.ids.clone(),
            h.clock.clone(),
        )
        .with_keep_finished(1);

        let a = h.enqueue("a", 9, &[]);
        let c = h.enqueue("c", 8, &["a"]);
        let b = h.enqueue("b", 1, &[]);

        assert_eq!(dispatcher.next_claimable("w").unwrap().map(|t| t.id), Some(a.clone()));
        h.clock.advance(ChronoDuration::seconds(1));
        dispatcher.report_outcome(&a, "w", true, None).unwrap();
        assert_eq!(dispatcher.next_claimable("w").unwrap().map(|t| t.id), Some(c.clone()));
        h.clock.advance(ChronoDuration::seconds(1));
        dispatcher.report_outcome(&c, "w", false, None).unwrap();
        assert_eq!(dispatcher.next_claimable("w").unwrap().map(|t| t.id), Some(b.clone()));
        h.clock.advance(ChronoDuration::seconds(1));
        dispatcher.report_outcome(&b, "w", true, None).unwrap();

        // "c" failed with retries left, so "a" must survive for its rerun
        assert!(dispatcher.snapshot().contains(&a));
        dispatcher.requeue(&c).unwrap();
        assert_eq!(dispatcher.next_claimable("w").unwrap().map(|t| t.id), Some(c));
    }
}
