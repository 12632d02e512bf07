//! Dependency graph over a task list.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges are kept in sync
//!
//! The graph is rebuilt from a `TaskList` snapshot each time it is needed;
//! the task document stays the only source of truth.

use std::collections::{HashMap, HashSet};

use crate::domain::{Task, TaskId, TaskStatus};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks waiting for it
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,

    statuses: HashMap<TaskId, TaskStatus>,

    /// Tasks that will never run again: completed, or failed with no
    /// retries left.
    settled: HashSet<TaskId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut graph = Self::new();
        for task in tasks {
            graph.statuses.insert(task.id.clone(), task.status);
            let retries_left = task.status == TaskStatus::Failed && !task.retries_exhausted();
            if task.status.is_terminal() && !retries_left {
                graph.settled.insert(task.id.clone());
            }
            for dep in &task.dependencies {
                graph.add_dependency(task.id.clone(), dep.clone());
            }
        }
        graph
    }

    /// `task` waits for `depends_on`. Updates both edge maps.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges
            .entry(task.clone())
            .or_default()
            .insert(depends_on.clone());
        self.reverse_edges.entry(depends_on).or_default().insert(task);
    }

    /// Every dependency of `task` is known and `completed`.
    ///
    /// A dependency that is not in the list (pruned, or a hand-edited
    /// document) counts as unmet.
    pub fn is_satisfied(&self, task: &TaskId) -> bool {
        self.unmet_dependencies(task).is_empty()
    }

    /// Dependencies of `task` that are not `completed`, sorted.
    pub fn unmet_dependencies(&self, task: &TaskId) -> Vec<TaskId> {
        let mut unmet: Vec<TaskId> = self
            .edges
            .get(task)
            .into_iter()
            .flatten()
            .filter(|dep| self.statuses.get(*dep) != Some(&TaskStatus::Completed))
            .cloned()
            .collect();
        unmet.sort();
        unmet
    }

    /// Tasks waiting for `task`, whether or not they have other dependencies.
    pub fn get_waiting_tasks(&self, task: &TaskId) -> Vec<TaskId> {
        let mut waiting: Vec<TaskId> = self
            .reverse_edges
            .get(task)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default();
        waiting.sort();
        waiting
    }

    /// Some task that may still run waits for `task`. A failed task with
    /// retries left counts, since the rebalancer will queue it again.
    pub fn has_pending_dependents(&self, task: &TaskId) -> bool {
        self.reverse_edges.get(task).is_some_and(|waiting| {
            waiting
                .iter()
                .any(|w| self.statuses.contains_key(w) && !self.settled.contains(w))
        })
    }

    pub fn has_dependencies(&self, task: &TaskId) -> bool {
        self.edges.get(task).is_some_and(|deps| !deps.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DEFAULT_MAX_RETRIES;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn task(id: &str, status: TaskStatus, deps: &[&str]) -> Task {
        Task {
            id: TaskId::from(id),
            task_type: "build".into(),
            description: String::new(),
            priority: 5,
            status,
            assigned_agent: None,
            dependencies: deps.iter().map(|d| TaskId::from(*d)).collect::<BTreeSet<_>>(),
            created_at: Utc::now(),
            throttled: false,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            notes: None,
            updated_at: None,
        }
    }

    #[test]
    fn forward_and_reverse_edges_agree() {
        let tasks = [
            task("a", TaskStatus::Queued, &[]),
            task("b", TaskStatus::Queued, &["a"]),
            task("c", TaskStatus::Queued, &["a", "b"]),
        ];
        let graph = DependencyGraph::from_tasks(&tasks);

        assert!(!graph.has_dependencies(&TaskId::from("a")));
        assert!(graph.has_dependencies(&TaskId::from("c")));
        assert_eq!(
            graph.get_waiting_tasks(&TaskId::from("a")),
            vec![TaskId::from("b"), TaskId::from("c")]
        );
    }

    #[test]
    fn only_completed_dependencies_count() {
        let tasks = [
            task("a", TaskStatus::Completed, &[]),
            task("b", TaskStatus::Failed, &[]),
            task("c", TaskStatus::Queued, &["a"]),
            task("d", TaskStatus::Queued, &["a", "b"]),
        ];
        let graph = DependencyGraph::from_tasks(&tasks);

        assert!(graph.is_satisfied(&TaskId::from("c")));
        assert!(!graph.is_satisfied(&TaskId::from("d")));
        assert_eq!(graph.unmet_dependencies(&TaskId::from("d")), vec![TaskId::from("b")]);
    }

    #[test]
    fn missing_dependency_is_unmet() {
        let tasks = [task("c", TaskStatus::Queued, &["ghost"])];
        let graph = DependencyGraph::from_tasks(&tasks);
        assert!(!graph.is_satisfied(&TaskId::from("c")));
    }

    #[test]
    fn pending_dependents_protect_a_finished_task() {
        let tasks = [
            task("a", TaskStatus::Completed, &[]),
            task("b", TaskStatus::Queued, &["a"]),
            task("c", TaskStatus::Completed, &[]),
            task("d", TaskStatus::Completed, &["c"]),
        ];
        let graph = DependencyGraph::from_tasks(&tasks);
        assert!(graph.has_pending_dependents(&TaskId::from("a")));
        assert!(!graph.has_pending_dependents(&TaskId::from("c")));
    }

    #[test]
    fn failed_dependent_is_pending_until_its_retries_run_out() {
        let mut exhausted = task("d", TaskStatus::Failed, &["c"]);
        exhausted.retries = exhausted.max_retries;
        let tasks = [
            task("a", TaskStatus::Completed, &[]),
            task("b", TaskStatus::Failed, &["a"]),
            task("c", TaskStatus::Completed, &[]),
            exhausted,
        ];
        let graph = DependencyGraph::from_tasks(&tasks);
        assert!(graph.has_pending_dependents(&TaskId::from("a")));
        assert!(!graph.has_pending_dependents(&TaskId::from("c")));
    }
}
