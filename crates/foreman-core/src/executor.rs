//! Task executors: the pluggable side of the worker.
//!
//! The coordinator only hands an executor `{id, description, priority}` and
//! records the verdict. What a "build" or "scan" actually does lives outside.

use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use crate::domain::{Task, TaskId};
use crate::error::ExecutorError;
use crate::ports::AGENT_NAME_ENV;

const MAX_NOTES_LEN: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub id: TaskId,
    pub description: String,
    pub priority: u8,
}

impl From<&Task> for TaskRequest {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            priority: task.priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub notes: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(notes: impl Into<String>) -> Self {
        Self {
            success: true,
            notes: Some(notes.into()),
        }
    }

    pub fn failed(notes: impl Into<String>) -> Self {
        Self {
            success: false,
            notes: Some(notes.into()),
        }
    }
}

/// Executes one task type.
///
/// `Err` means the executor itself broke (could not start, panicked input);
/// a task that ran and failed is `Ok` with `success: false`. Both end up as
/// a failed outcome.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &TaskRequest) -> Result<ExecutionOutcome, ExecutorError>;
}

/// Registry of executors (task type -> executor).
///
/// Built during initialization, read-only afterwards.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, executor: Arc<dyn Executor>) -> Result<(), ExecutorError> {
        let task_type = task_type.into();
        if self.executors.contains_key(&task_type) {
            return Err(ExecutorError::Duplicate(task_type));
        }
        self.executors.insert(task_type, executor);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn Executor>> {
        self.executors.get(task_type)
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    pub fn task_types(&self) -> BTreeSet<String> {
        self.executors.keys().cloned().collect()
    }

    /// Keep only the types in `capabilities`. An empty set keeps everything.
    pub fn retain_capabilities(&mut self, capabilities: &BTreeSet<String>) {
        if capabilities.is_empty() {
            return;
        }
        self.executors.retain(|ty, _| capabilities.contains(ty));
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Run `task_type`'s executor. Executor errors become a failed outcome.
    pub async fn execute(&self, task_type: &str, request: &TaskRequest) -> ExecutionOutcome {
        let Some(executor) = self.get(task_type) else {
            return ExecutionOutcome::failed(ExecutorError::NotRegistered(task_type.to_string()).to_string());
        };
        match executor.execute(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id = %request.id, task_type, error = %e, "executor error");
                ExecutionOutcome::failed(e.to_string())
            }
        }
    }
}

/// Runs an external command per task.
///
/// The task is passed through the environment (`FOREMAN_TASK_ID`,
/// `FOREMAN_TASK_DESCRIPTION`, `FOREMAN_TASK_PRIORITY`). Exit status 0 is
/// success; the tail of stdout/stderr becomes the notes.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    task_type: String,
    argv: Vec<String>,
}

impl CommandExecutor {
    pub fn new(task_type: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            task_type: task_type.into(),
            argv,
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, request: &TaskRequest) -> Result<ExecutionOutcome, ExecutorError> {
        let crashed = |reason: String| ExecutorError::Crashed {
            task_type: self.task_type.clone(),
            reason,
        };
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| crashed("empty command".to_string()))?;

        // task children must not pass for instances of the agent
        let output = Command::new(program)
            .args(args)
            .env_remove(AGENT_NAME_ENV)
            .env("FOREMAN_TASK_ID", request.id.as_str())
            .env("FOREMAN_TASK_DESCRIPTION", &request.description)
            .env("FOREMAN_TASK_PRIORITY", request.priority.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| crashed(format!("failed to start {program}: {e}")))?;

        let mut notes = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !stderr.trim().is_empty() {
            if !notes.is_empty() {
                notes.push('\n');
            }
            notes.push_str(stderr.trim());
        }
        let notes = tail(&notes, MAX_NOTES_LEN);

        Ok(ExecutionOutcome {
            success: output.status.success(),
            notes: if notes.is_empty() {
                Some(format!("exit status {}", output.status))
            } else {
                Some(notes)
            },
        })
    }
}

/// The last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(bool);

    #[async_trait]
    impl Executor for Fixed {
        async fn execute(&self, _request: &TaskRequest) -> Result<ExecutionOutcome, ExecutorError> {
            Ok(ExecutionOutcome {
                success: self.0,
                notes: None,
            })
        }
    }

    struct Broken;

    #[async_trait]
    impl Executor for Broken {
        async fn execute(&self, _request: &TaskRequest) -> Result<ExecutionOutcome, ExecutorError> {
            Err(ExecutorError::Crashed {
                task_type: "build".into(),
                reason: "segfault".into(),
            })
        }
    }

    fn request() -> TaskRequest {
        TaskRequest {
            id: TaskId::from("t1"),
            description: "compile".into(),
            priority: 5,
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = ExecutorRegistry::new();
        reg.register("build", Arc::new(Fixed(true))).unwrap();
        assert!(matches!(
            reg.register("build", Arc::new(Fixed(false))),
            Err(ExecutorError::Duplicate(ty)) if ty == "build"
        ));
    }

    #[test]
    fn capabilities_narrow_the_registry() {
        let mut reg = ExecutorRegistry::new();
        reg.register("build", Arc::new(Fixed(true))).unwrap();
        reg.register("docs", Arc::new(Fixed(true))).unwrap();

        reg.retain_capabilities(&BTreeSet::new());
        assert_eq!(reg.len(), 2);

        reg.retain_capabilities(&["docs".to_string()].into());
        assert_eq!(reg.task_types(), ["docs".to_string()].into());
    }

    #[tokio::test]
    async fn executor_errors_become_failed_outcomes() {
        let mut reg = ExecutorRegistry::new();
        reg.register("build", Arc::new(Broken)).unwrap();

        let outcome = reg.execute("build", &request()).await;
        assert!(!outcome.success);
        assert!(outcome.notes.unwrap().contains("segfault"));

        let outcome = reg.execute("missing", &request()).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn command_executor_reports_exit_status_and_output() {
        let ok = CommandExecutor::new(
            "echo",
            vec!["sh".into(), "-c".into(), "echo \"$FOREMAN_TASK_ID:$FOREMAN_TASK_DESCRIPTION\"".into()],
        );
        let outcome = ok.execute(&request()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.notes.as_deref(), Some("t1:compile"));

        let fail = CommandExecutor::new("fail", vec!["sh".into(), "-c".into(), "echo nope >&2; exit 3".into()]);
        let outcome = fail.execute(&request()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.notes.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn missing_program_is_an_executor_error() {
        let exec = CommandExecutor::new("build", vec!["/definitely/not/here".into()]);
        assert!(matches!(
            exec.execute(&request()).await,
            Err(ExecutorError::Crashed { .. })
        ));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "ééééé";
        let t = tail(s, 3);
        assert!(t.starts_with("..."));
        assert!(t.ends_with('é'));
    }
}
