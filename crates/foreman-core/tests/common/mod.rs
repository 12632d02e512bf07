#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use foreman_core::app::{Fleet, FleetBuilder};
use foreman_core::config::FleetConfig;
use foreman_core::error::ExecutorError;
use foreman_core::executor::{ExecutionOutcome, Executor, ExecutorRegistry, TaskRequest};
use foreman_core::ports::{FixedClock, LaunchSpec, ProcessControl, ProcessInfo, Signal};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[derive(Default)]
struct Table {
    /// pid -> (command line, FOREMAN_AGENT_NAME)
    running: BTreeMap<u32, (String, Option<String>)>,
    zombies: Vec<ProcessInfo>,
    load: Option<f64>,
    next_pid: u32,
    spawned: Vec<LaunchSpec>,
    signals: Vec<(u32, Signal)>,
    ignores_term: BTreeSet<u32>,
    fail_spawn: bool,
}

/// An in-memory process table.
#[derive(Default)]
pub struct FakeProcesses {
    table: Mutex<Table>,
}

impl FakeProcesses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn start(&self, pid: u32, command_line: &str) {
        self.table
            .lock()
            .unwrap()
            .running
            .insert(pid, (command_line.to_string(), None));
    }

    /// A process started with `FOREMAN_AGENT_NAME=<agent>` in its environment.
    pub fn start_as(&self, pid: u32, command_line: &str, agent: &str) {
        self.table
            .lock()
            .unwrap()
            .running
            .insert(pid, (command_line.to_string(), Some(agent.to_string())));
    }

    pub fn crash(&self, pid: u32) {
        self.table.lock().unwrap().running.remove(&pid);
    }

    pub fn add_zombie(&self, pid: u32, command_line: &str) {
        self.table.lock().unwrap().zombies.push(ProcessInfo {
            pid,
            state: 'Z',
            command_line: command_line.to_string(),
            agent_name: None,
        });
    }

    pub fn set_load(&self, load: f64) {
        self.table.lock().unwrap().load = Some(load);
    }

    pub fn ignore_sigterm(&self, pid: u32) {
        self.table.lock().unwrap().ignores_term.insert(pid);
    }

    pub fn fail_spawns(&self) {
        self.table.lock().unwrap().fail_spawn = true;
    }

    pub fn spawned(&self) -> Vec<LaunchSpec> {
        self.table.lock().unwrap().spawned.clone()
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.table.lock().unwrap().signals.clone()
    }
}

impl ProcessControl for FakeProcesses {
    fn is_running(&self, pid: u32) -> bool {
        self.table.lock().unwrap().running.contains_key(&pid)
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        self.table.lock().unwrap().running.get(&pid).map(|(cmd, _)| cmd.clone())
    }

    fn agent_name(&self, pid: u32) -> Option<String> {
        self.table
            .lock()
            .unwrap()
            .running
            .get(&pid)
            .and_then(|(_, agent)| agent.clone())
    }

    fn snapshot(&self) -> Vec<ProcessInfo> {
        let table = self.table.lock().unwrap();
        table
            .running
            .iter()
            .map(|(&pid, (cmd, agent))| ProcessInfo {
                pid,
                state: 'S',
                command_line: cmd.clone(),
                agent_name: agent.clone(),
            })
            .chain(table.zombies.iter().cloned())
            .collect()
    }

    fn load_average(&self) -> Option<f64> {
        self.table.lock().unwrap().load
    }

    fn spawn(&self, spec: &LaunchSpec) -> io::Result<u32> {
        let mut table = self.table.lock().unwrap();
        if table.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
        }
        table.next_pid = table.next_pid.max(10_000) + 1;
        let pid = table.next_pid;
        table
            .running
            .insert(pid, (spec.command.join(" "), Some(spec.agent.clone())));
        table.spawned.push(spec.clone());
        Ok(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let mut table = self.table.lock().unwrap();
        table.signals.push((pid, signal));
        if signal == Signal::Kill || !table.ignores_term.contains(&pid) {
            table.running.remove(&pid);
        }
        Ok(())
    }

    fn reap_children(&self) -> usize {
        0
    }
}

/// Succeeds or fails every task it is given.
pub struct Scripted {
    pub success: bool,
}

#[async_trait]
impl Executor for Scripted {
    async fn execute(&self, request: &TaskRequest) -> Result<ExecutionOutcome, ExecutorError> {
        let notes = format!("ran {}", request.id);
        Ok(if self.success {
            ExecutionOutcome::succeeded(notes)
        } else {
            ExecutionOutcome::failed(notes)
        })
    }
}

pub fn executors(entries: &[(&str, bool)]) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for (task_type, success) in entries {
        registry
            .register(*task_type, Arc::new(Scripted { success: *success }))
            .unwrap();
    }
    registry
}

pub fn config(state_dir: &Path) -> FleetConfig {
    FleetConfig {
        state_dir: state_dir.to_path_buf(),
        poll_interval_secs: 1,
        lock_timeout_ms: 2_000,
        ..FleetConfig::default()
    }
}

pub struct TestFleet {
    pub fleet: Fleet,
    pub clock: Arc<FixedClock>,
    pub processes: Arc<FakeProcesses>,
}

pub fn fleet_with(config: FleetConfig, registry: ExecutorRegistry) -> TestFleet {
    let clock = Arc::new(FixedClock::new(t0()));
    let processes = FakeProcesses::new();
    let fleet = FleetBuilder::new(config)
        .clock(clock.clone())
        .processes(processes.clone())
        .executors(registry)
        .build()
        .unwrap();
    TestFleet {
        fleet,
        clock,
        processes,
    }
}
