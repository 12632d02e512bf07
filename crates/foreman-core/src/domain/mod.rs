//! Domain model: tasks, agents, and the history documents.
//!
//! Every type here is what ends up on disk, so field names follow the
//! persisted schema (`type`, `assigned_agent`, `last_seen`, ...).

pub mod agent;
pub mod history;
pub mod ids;
pub mod task;

pub use agent::{AgentRecord, AgentRegistryDoc, AgentStatus};
pub use history::{
    DeadLetter, DeadLetterEntry, FailureLog, FailureRecord, PendingEscalation, RestartEvent, RestartLog,
};
pub use ids::TaskId;
pub use task::{DEFAULT_MAX_RETRIES, NewTask, Task, TaskList, TaskStatus};
