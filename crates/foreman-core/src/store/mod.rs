//! Durable store: named locks and the JSON documents under the state dir.
//!
//! Layout of `<state_dir>`:
//! - `tasks.json`, `agents.json`: the task list and the agent registry
//! - `failures.json`, `restarts.json`, `dead_letter.json`: history
//! - `locks/<resource>.lock`: one flock file per named lock
//! - `logs/<agent>.out|.err`: output of agents launched by the supervisor

mod document;
mod lock;

pub use document::JsonDocument;
pub use lock::{FileLockManager, LockGuard};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{AgentRegistryDoc, DeadLetter, FailureLog, RestartLog, TaskList};

pub type TaskStore = JsonDocument<TaskList>;
pub type AgentStore = JsonDocument<AgentRegistryDoc>;
pub type FailureStore = JsonDocument<FailureLog>;
pub type RestartStore = JsonDocument<RestartLog>;
pub type DeadLetterStore = JsonDocument<DeadLetter>;

/// Every document of one state directory, sharing one lock manager.
#[derive(Debug, Clone)]
pub struct Stores {
    root: PathBuf,
    pub locks: Arc<FileLockManager>,
    pub tasks: Arc<TaskStore>,
    pub agents: Arc<AgentStore>,
    pub failures: Arc<FailureStore>,
    pub restarts: Arc<RestartStore>,
    pub dead_letter: Arc<DeadLetterStore>,
}

impl Stores {
    /// Nothing is touched on disk until the first write.
    pub fn open(state_dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let root = state_dir.into();
        let locks = Arc::new(FileLockManager::new(root.join("locks")));
        Self {
            tasks: open_doc(&root, "tasks", &locks, lock_timeout),
            agents: open_doc(&root, "agents", &locks, lock_timeout),
            failures: open_doc(&root, "failures", &locks, lock_timeout),
            restarts: open_doc(&root, "restarts", &locks, lock_timeout),
            dead_letter: open_doc(&root, "dead_letter", &locks, lock_timeout),
            locks,
            root,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// `<root>/<resource>.json`, guarded by the lock of the same name.
fn open_doc<T>(
    root: &Path,
    resource: &str,
    locks: &Arc<FileLockManager>,
    lock_timeout: Duration,
) -> Arc<JsonDocument<T>>
where
    T: Serialize + DeserializeOwned + Default + Clone + PartialEq,
{
    let path = root.join(format!("{resource}.json"));
    Arc::new(JsonDocument::new(path, resource, locks.clone(), lock_timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::AgentStatus;
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn documents_live_side_by_side_in_the_state_dir() {
        let dir = tempdir().unwrap();
        let stores = Stores::open(dir.path(), Duration::from_millis(200));

        stores
            .agents
            .save(|doc| {
                doc.upsert("build-agent", AgentStatus::Starting, Utc::now());
            })
            .unwrap();

        assert!(dir.path().join("agents.json").exists());
        assert!(!dir.path().join("tasks.json").exists());
        assert!(dir.path().join("locks").join("agents.lock").exists());
        assert_eq!(stores.log_dir(), dir.path().join("logs"));
    }
}
