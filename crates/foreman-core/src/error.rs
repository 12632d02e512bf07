use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{TaskId, TaskStatus};

/// Advisory lock acquisition failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock '{resource}'")]
    Timeout { resource: String, waited: Duration },

    #[error("lock '{resource}' unavailable: {source}")]
    Io {
        resource: String,
        #[source]
        source: std::io::Error,
    },
}

/// Durable store failures.
///
/// - `Write`: the temp-file write or the rename failed; the mutation is lost
///   unless the update is retried.
/// - `Lock`: the document lock could not be taken (contention).
/// - `StaleRead`: the document changed on disk between load and write.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to persist {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{path} was modified outside the lock between load and write")]
    StaleRead { path: PathBuf },
}

impl StoreError {
    /// Retrying the whole read-modify-write may succeed. Only a lock file
    /// that cannot be opened at all is treated as permanent.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Lock(LockError::Io { .. }))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {id} is owned by {}, not {agent}", owner.as_deref().unwrap_or("nobody"))]
    NotOwner {
        id: TaskId,
        agent: String,
        owner: Option<String>,
    },

    #[error("dependency {0} does not exist")]
    UnknownDependency(TaskId),

    #[error("priority {0} is outside 1..=10")]
    InvalidPriority(u8),
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to launch agent '{agent}': {source}")]
    Launch {
        agent: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no launch command configured for agent '{0}'")]
    NoLaunchCommand(String),

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no executor registered for task type '{0}'")]
    NotRegistered(String),

    #[error("duplicate executor for task type '{0}'")]
    Duplicate(String),

    #[error("executor for '{task_type}' crashed: {reason}")]
    Crashed { task_type: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("missing task types: {0:?}; these were expected but have no executor")]
    MissingTaskTypes(Vec<String>),
}

/// Top-level error for fleet operations.
#[derive(Debug, Error)]
pub enum ForemanError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("agent '{0}' is not registered")]
    AgentNotFound(String),

    /// A blocking store call handed off by the worker panicked.
    #[error("background store call failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<LockError> for ForemanError {
    fn from(err: LockError) -> Self {
        ForemanError::Store(StoreError::Lock(err))
    }
}

impl ForemanError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ForemanError::Store(e) => e.is_retryable(),
            ForemanError::Dispatch(DispatchError::Store(e)) => e.is_retryable(),
            ForemanError::Spawn(SpawnError::Launch { .. }) => true,
            _ => false,
        }
    }
}
