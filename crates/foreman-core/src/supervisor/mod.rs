//! Agent Supervisor - 生存監視と再起動
//!
//! # Design
//! - Liveness combines the heartbeat age with an OS check of the recorded
//!   pid (see [`Liveness`]).
//! - Check-and-spawn for one agent runs under the `spawn-<agent>` lock so
//!   two supervisors cannot both revive it. Registry and restart-log writes
//!   happen inside that lock, one document lock at a time.
//! - A failed spawn is logged and retried on the next sweep; it never stops
//!   the sweep.

mod liveness;
mod registry;

pub use liveness::{Liveness, Verdict};

use liveness::runs_as;
pub use registry::AgentRegistry;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::domain::{AgentRecord, RestartEvent};
use crate::error::{ForemanError, SpawnError};
use crate::ports::{Clock, LaunchSpec, ProcessControl, ProcessInfo, Signal};
use crate::store::{FileLockManager, RestartStore, Stores};

const STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(100);

/// How to (re)launch one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentLaunch {
    pub command: Vec<String>,
    pub capabilities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    Alive,
    Restarted {
        old_pid: Option<u32>,
        new_pid: u32,
        restart_count: u64,
    },
    /// Dead, but nothing is configured to launch it.
    NoLaunchCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub pid: Option<u32>,
    /// SIGTERM was not enough.
    pub killed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub alive: usize,
    pub reaped: usize,
    pub restarted: Vec<(String, u32)>,
    pub stopped: Vec<String>,
    pub no_command: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub zombies: Vec<ProcessInfo>,
}

pub struct AgentSupervisor {
    registry: Arc<AgentRegistry>,
    liveness: Liveness,
    restarts: Arc<RestartStore>,
    locks: Arc<FileLockManager>,
    processes: Arc<dyn ProcessControl>,
    clock: Arc<dyn Clock>,
    launches: BTreeMap<String, AgentLaunch>,
    log_dir: PathBuf,
    lock_timeout: Duration,
    restart_log_limit: usize,
    stop_grace: Duration,
}

impl AgentSupervisor {
    pub fn new(
        stores: &Stores,
        processes: Arc<dyn ProcessControl>,
        clock: Arc<dyn Clock>,
        liveness_timeout: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(AgentRegistry::new(stores.agents.clone(), clock.clone())),
            liveness: Liveness::new(processes.clone(), clock.clone(), liveness_timeout),
            restarts: stores.restarts.clone(),
            locks: stores.locks.clone(),
            processes,
            clock,
            launches: BTreeMap::new(),
            log_dir: stores.log_dir(),
            lock_timeout,
            restart_log_limit: 100,
            stop_grace: STOP_GRACE,
        }
    }

    pub fn with_launches(mut self, launches: BTreeMap<String, AgentLaunch>) -> Self {
        self.launches = launches;
        self
    }

    pub fn with_restart_log_limit(mut self, limit: usize) -> Self {
        self.restart_log_limit = limit;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn restart_count(&self, name: &str) -> u64 {
        self.restarts.load().count_for(name)
    }

    pub fn assess(&self, name: &str) -> Verdict {
        match self.registry.get(name) {
            Some(rec) => self.liveness.assess(&rec),
            None => Verdict::Unregistered,
        }
    }

    pub fn is_alive(&self, name: &str) -> bool {
        self.assess(name).is_alive()
    }

    /// Registered agents plus configured ones that never registered.
    pub fn known_agents(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.registry.list().into_iter().map(|r| r.name).collect();
        names.extend(self.launches.keys().cloned());
        names
    }

    /// Relaunch `name` unless it is alive.
    ///
    /// A stopped agent counts as dead here; the sweep is what leaves stopped
    /// agents alone.
    pub fn revive_if_dead(&self, name: &str) -> Result<RestartOutcome, ForemanError> {
        let _spawn = self.locks.acquire(&spawn_lock(name), self.lock_timeout)?;

        let record = self.registry.get(name);
        let verdict = record
            .as_ref()
            .map_or(Verdict::Unregistered, |r| self.liveness.assess(r));
        if verdict.is_alive() {
            return Ok(RestartOutcome::Alive);
        }
        let Some(launch) = self.launches.get(name).filter(|l| !l.command.is_empty()) else {
            return Ok(RestartOutcome::NoLaunchCommand);
        };

        let old_pid = record.as_ref().and_then(AgentRecord::live_pid);
        if let (Some(pid), Some(record)) = (old_pid, record.as_ref()) {
            if self.owns_pid(pid, record) {
                info!(agent = name, pid, "terminating unresponsive instance");
                self.terminate(pid)?;
            }
        }

        let spec = LaunchSpec {
            agent: name.to_string(),
            command: launch.command.clone(),
            log_dir: self.log_dir.clone(),
        };
        let new_pid = self.processes.spawn(&spec).map_err(|source| SpawnError::Launch {
            agent: name.to_string(),
            source,
        })?;
        self.registry
            .record_launch(name, new_pid, &launch.command, &launch.capabilities)?;

        let event = RestartEvent {
            agent_name: name.to_string(),
            timestamp: self.clock.now(),
            old_pid,
            new_pid,
            reason: verdict.to_string(),
        };
        let limit = self.restart_log_limit;
        let restart_count = self.restarts.save(|log| log.record(event.clone(), limit))?;

        info!(agent = name, ?old_pid, new_pid, restart_count, reason = %verdict, "agent restarted");
        Ok(RestartOutcome::Restarted {
            old_pid,
            new_pid,
            restart_count,
        })
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL; mark `stopped`.
    pub fn stop_agent(&self, name: &str) -> Result<StopOutcome, ForemanError> {
        let _spawn = self.locks.acquire(&spawn_lock(name), self.lock_timeout)?;
        let record = self
            .registry
            .get(name)
            .ok_or_else(|| ForemanError::AgentNotFound(name.to_string()))?;

        let pid = record.live_pid().filter(|&pid| self.owns_pid(pid, &record));
        let killed = match pid {
            Some(pid) => self.terminate(pid)?,
            None => false,
        };
        self.registry.mark_stopped(name)?;
        info!(agent = name, ?pid, killed, "agent stopped");
        Ok(StopOutcome { pid, killed })
    }

    /// One pass over every known agent: reap our exited children, revive
    /// the dead, and log zombie processes that look like agents.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            reaped: self.processes.reap_children(),
            ..SweepReport::default()
        };
        if report.reaped > 0 {
            debug!(reaped = report.reaped, "reaped exited children");
        }

        let names = self.known_agents();
        for name in &names {
            report.checked += 1;
            match self.assess(name) {
                Verdict::Alive => {
                    report.alive += 1;
                    continue;
                }
                Verdict::Stopped => {
                    report.stopped.push(name.clone());
                    continue;
                }
                verdict => debug!(agent = %name, %verdict, "agent presumed dead"),
            }
            match self.revive_if_dead(name) {
                Ok(RestartOutcome::Alive) => report.alive += 1,
                Ok(RestartOutcome::Restarted { new_pid, .. }) => report.restarted.push((name.clone(), new_pid)),
                Ok(RestartOutcome::NoLaunchCommand) => {
                    warn!(agent = %name, "agent is dead and has no launch command, skipping");
                    report.no_command.push(name.clone());
                }
                Err(e) => {
                    warn!(agent = %name, error = %e, "revive failed, will retry next sweep");
                    report.failed.push((name.clone(), e.to_string()));
                }
            }
        }

        report.zombies = self.scan_zombies(&names);
        report
    }

    /// Defunct processes that look like instances of a known agent.
    pub fn scan_zombies(&self, names: &BTreeSet<String>) -> Vec<ProcessInfo> {
        let zombies: Vec<ProcessInfo> = self
            .processes
            .snapshot()
            .into_iter()
            .filter(|p| p.is_zombie() && names.iter().any(|n| p.runs_agent(n)))
            .collect();
        for z in &zombies {
            warn!(pid = z.pid, command = %z.command_line, "zombie agent process");
        }
        zombies
    }

    /// Is `pid` still running as `record`'s agent? Never signal anything else.
    fn owns_pid(&self, pid: u32, record: &AgentRecord) -> bool {
        self.processes.is_running(pid) && runs_as(self.processes.as_ref(), pid, record)
    }

    /// Returns true if SIGKILL was needed.
    fn terminate(&self, pid: u32) -> Result<bool, SpawnError> {
        let signal_err = |source| SpawnError::Signal { pid, source };
        self.processes.signal(pid, Signal::Terminate).map_err(signal_err)?;
        let deadline = Instant::now() + self.stop_grace;
        while Instant::now() < deadline {
            self.processes.reap_children();
            if !self.processes.is_running(pid) {
                return Ok(false);
            }
            thread::sleep(STOP_POLL.min(self.stop_grace));
        }
        warn!(pid, "process ignored SIGTERM, sending SIGKILL");
        self.processes.signal(pid, Signal::Kill).map_err(signal_err)?;
        self.processes.reap_children();
        Ok(true)
    }
}

fn spawn_lock(name: &str) -> String {
    format!("spawn-{name}")
}
