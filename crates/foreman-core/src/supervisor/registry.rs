//! Agent registry - agents.json の読み書き
//!
//! Uses the registry document's own lock, so heartbeats never wait on the
//! task queue.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::domain::{AgentRecord, AgentStatus, TaskId};
use crate::error::StoreError;
use crate::ports::Clock;
use crate::store::AgentStore;

pub struct AgentRegistry {
    store: Arc<AgentStore>,
    clock: Arc<dyn Clock>,
}

impl AgentRegistry {
    pub fn new(store: Arc<AgentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Upsert `name` as `starting` with a fresh heartbeat.
    pub fn register_agent(
        &self,
        name: &str,
        pid: u32,
        capabilities: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.register_instance(name, pid, None, capabilities)
    }

    /// [`register_agent`](Self::register_agent), also recording the argv the
    /// instance runs so liveness can recognise it by its command line.
    pub fn register_instance(
        &self,
        name: &str,
        pid: u32,
        command_line: Option<String>,
        capabilities: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.store.save(|doc| {
            let rec = doc.upsert(name, AgentStatus::Starting, now);
            rec.pid = Some(pid);
            rec.command_line = command_line.clone();
            rec.status = AgentStatus::Starting;
            rec.last_seen = now;
            rec.current_task = None;
            rec.capabilities = capabilities.clone();
            doc.last_update = Some(now);
        })?;
        debug!(agent = name, pid, "agent registered");
        Ok(())
    }

    pub fn heartbeat(
        &self,
        name: &str,
        status: AgentStatus,
        current_task: Option<&TaskId>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.store.save(|doc| {
            let rec = doc.upsert(name, status, now);
            rec.status = status;
            rec.last_seen = now;
            rec.current_task = current_task.cloned();
            doc.last_update = Some(now);
        })
    }

    pub fn record_completion(&self, name: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        self.store.save(|doc| {
            let rec = doc.upsert(name, AgentStatus::Available, now);
            rec.tasks_completed += 1;
            let completed = rec.tasks_completed;
            doc.last_update = Some(now);
            completed
        })
    }

    /// Graceful shutdown or an explicit stop: no pid, no task.
    pub fn mark_stopped(&self, name: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.store.save(|doc| {
            let rec = doc.upsert(name, AgentStatus::Stopped, now);
            rec.status = AgentStatus::Stopped;
            rec.pid = None;
            rec.command_line = None;
            rec.current_task = None;
            rec.last_seen = now;
            doc.last_update = Some(now);
        })
    }

    /// The supervisor launched a new instance running `command`. The
    /// heartbeat is reset so the new process gets a full liveness timeout to
    /// check in.
    pub fn record_launch(
        &self,
        name: &str,
        pid: u32,
        command: &[String],
        capabilities: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let command_line = command.join(" ");
        self.store.save(|doc| {
            let rec = doc.upsert(name, AgentStatus::Starting, now);
            rec.pid = Some(pid);
            rec.command_line = Some(command_line.clone());
            rec.status = AgentStatus::Starting;
            rec.last_seen = now;
            rec.current_task = None;
            if rec.capabilities.is_empty() {
                rec.capabilities = capabilities.clone();
            }
            doc.last_update = Some(now);
        })
    }

    pub fn get(&self, name: &str) -> Option<AgentRecord> {
        self.store.load().agents.get(name).cloned()
    }

    /// All records, sorted by name.
    pub fn list(&self) -> Vec<AgentRecord> {
        self.store.load().agents.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use crate::store::Stores;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::tempdir;

    #[test]
    fn lifecycle_updates_the_record() {
        let dir = tempdir().unwrap();
        let stores = Stores::open(dir.path(), std::time::Duration::from_millis(500));
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let reg = AgentRegistry::new(stores.agents.clone(), clock.clone());
        let caps: BTreeSet<String> = ["build".to_string()].into();

        reg.register_agent("build-agent", 4242, &caps).unwrap();
        let rec = reg.get("build-agent").unwrap();
        assert_eq!(rec.status, AgentStatus::Starting);
        assert_eq!(rec.pid, Some(4242));
        assert!(rec.capabilities.contains("build"));

        clock.advance(Duration::seconds(30));
        let task = TaskId::from("t1");
        reg.heartbeat("build-agent", AgentStatus::Busy, Some(&task)).unwrap();
        let rec = reg.get("build-agent").unwrap();
        assert_eq!(rec.status, AgentStatus::Busy);
        assert_eq!(rec.current_task, Some(task));
        assert_eq!(rec.last_seen, clock.now());

        assert_eq!(reg.record_completion("build-agent").unwrap(), 1);
        assert_eq!(reg.record_completion("build-agent").unwrap(), 2);

        reg.mark_stopped("build-agent").unwrap();
        let rec = reg.get("build-agent").unwrap();
        assert_eq!(rec.status, AgentStatus::Stopped);
        assert_eq!(rec.pid, None);
        assert_eq!(rec.tasks_completed, 2);
    }

    #[test]
    fn launches_and_registrations_record_the_instance_command_line() {
        let dir = tempdir().unwrap();
        let stores = Stores::open(dir.path(), std::time::Duration::from_millis(500));
        let reg = AgentRegistry::new(stores.agents.clone(), Arc::new(crate::ports::SystemClock));
        let command = vec!["sh".to_string(), "-c".to_string(), "run-b".to_string()];

        reg.record_launch("b", 77, &command, &BTreeSet::new()).unwrap();
        assert_eq!(reg.get("b").unwrap().command_line.as_deref(), Some("sh -c run-b"));

        reg.register_instance("b", 78, Some("python3 agent_build.py".into()), &BTreeSet::new())
            .unwrap();
        let rec = reg.get("b").unwrap();
        assert_eq!(rec.pid, Some(78));
        assert_eq!(rec.command_line.as_deref(), Some("python3 agent_build.py"));

        reg.mark_stopped("b").unwrap();
        assert_eq!(reg.get("b").unwrap().command_line, None);
    }

    #[test]
    fn heartbeat_creates_unknown_agents() {
        let dir = tempdir().unwrap();
        let stores = Stores::open(dir.path(), std::time::Duration::from_millis(500));
        let reg = AgentRegistry::new(stores.agents.clone(), Arc::new(crate::ports::SystemClock));
        reg.heartbeat("late-joiner", AgentStatus::Idle, None).unwrap();
        assert_eq!(reg.list().len(), 1);
    }
}
