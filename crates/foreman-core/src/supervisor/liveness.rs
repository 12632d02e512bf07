//! Liveness - heartbeat と OS の両方で生死を判定
//!
//! An agent is alive only if its heartbeat is recent AND, when a pid is
//! recorded, that pid is running as the agent (see [`is_agent_process`]).
//! The reported `status` field is never trusted on its own.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{AgentRecord, AgentStatus};
use crate::ports::{Clock, ProcessControl, is_agent_process};

/// The supervisor's view of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    /// Shut down on purpose; not revived by the sweep.
    Stopped,
    Unregistered,
    HeartbeatStale { age_secs: i64 },
    ProcessGone { pid: u32 },
    /// The pid is running but belongs to something else now.
    PidReused { pid: u32 },
}

impl Verdict {
    pub fn is_alive(self) -> bool {
        matches!(self, Verdict::Alive)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Alive => f.write_str("alive"),
            Verdict::Stopped => f.write_str("stopped"),
            Verdict::Unregistered => f.write_str("never started"),
            Verdict::HeartbeatStale { age_secs } => write!(f, "heartbeat stale ({age_secs}s)"),
            Verdict::ProcessGone { pid } => write!(f, "process {pid} gone"),
            Verdict::PidReused { pid } => write!(f, "pid {pid} belongs to another command"),
        }
    }
}

pub struct Liveness {
    processes: Arc<dyn ProcessControl>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Liveness {
    pub fn new(processes: Arc<dyn ProcessControl>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            processes,
            clock,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn assess(&self, record: &AgentRecord) -> Verdict {
        if record.status == AgentStatus::Stopped {
            return Verdict::Stopped;
        }
        let age = self.clock.now() - record.last_seen;
        let limit = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        if age > limit {
            return Verdict::HeartbeatStale {
                age_secs: age.num_seconds(),
            };
        }
        let Some(pid) = record.live_pid() else {
            return Verdict::Alive;
        };
        if !self.processes.is_running(pid) {
            return Verdict::ProcessGone { pid };
        }
        if runs_as(self.processes.as_ref(), pid, record) {
            Verdict::Alive
        } else {
            Verdict::PidReused { pid }
        }
    }

    pub fn is_alive(&self, record: &AgentRecord) -> bool {
        self.assess(record).is_alive()
    }
}

/// Is the running `pid` an instance of `record`'s agent?
pub(crate) fn runs_as(processes: &dyn ProcessControl, pid: u32, record: &AgentRecord) -> bool {
    let env_name = processes.agent_name(pid);
    match processes.command_line(pid) {
        Some(cmd) => is_agent_process(&record.name, record.command_line.as_deref(), env_name.as_deref(), &cmd),
        // unreadable command line: the pid check is all we have
        None => env_name.is_none_or(|n| n == record.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, LaunchSpec, ProcessInfo, Signal};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::collections::HashMap;
    use std::io;

    /// pid -> (command line, FOREMAN_AGENT_NAME)
    struct Procs(HashMap<u32, (Option<&'static str>, Option<&'static str>)>);

    impl ProcessControl for Procs {
        fn is_running(&self, pid: u32) -> bool {
            self.0.contains_key(&pid)
        }
        fn command_line(&self, pid: u32) -> Option<String> {
            self.0.get(&pid).and_then(|(cmd, _)| *cmd).map(str::to_string)
        }
        fn agent_name(&self, pid: u32) -> Option<String> {
            self.0.get(&pid).and_then(|(_, env)| *env).map(str::to_string)
        }
        fn snapshot(&self) -> Vec<ProcessInfo> {
            Vec::new()
        }
        fn load_average(&self) -> Option<f64> {
            None
        }
        fn spawn(&self, _spec: &LaunchSpec) -> io::Result<u32> {
            Err(io::Error::other("unused"))
        }
        fn signal(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
            Ok(())
        }
        fn reap_children(&self) -> usize {
            0
        }
    }

    #[rstest]
    #[case::fresh_and_running(10, Some(100), AgentStatus::Available, Verdict::Alive)]
    #[case::fresh_without_pid(10, None, AgentStatus::Idle, Verdict::Alive)]
    #[case::stale_but_claims_available(301, Some(100), AgentStatus::Available, Verdict::HeartbeatStale { age_secs: 301 })]
    #[case::exactly_at_timeout(300, Some(100), AgentStatus::Busy, Verdict::Alive)]
    #[case::process_gone(10, Some(555), AgentStatus::Available, Verdict::ProcessGone { pid: 555 })]
    #[case::pid_reused(10, Some(200), AgentStatus::Available, Verdict::PidReused { pid: 200 })]
    #[case::unreadable_cmdline(10, Some(300), AgentStatus::Available, Verdict::Alive)]
    #[case::recorded_command_line(10, Some(400), AgentStatus::Busy, Verdict::Alive)]
    #[case::launched_with_agent_env(10, Some(500), AgentStatus::Busy, Verdict::Alive)]
    #[case::env_names_another_agent(10, Some(600), AgentStatus::Busy, Verdict::PidReused { pid: 600 })]
    #[case::stopped(0, None, AgentStatus::Stopped, Verdict::Stopped)]
    fn verdicts(
        #[case] age_secs: i64,
        #[case] pid: Option<u32>,
        #[case] status: AgentStatus,
        #[case] expected: Verdict,
    ) {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let procs = Procs(HashMap::from([
            (100, (Some("foreman worker --name build-agent"), None)),
            (200, (Some("/usr/bin/vim notes.txt"), None)),
            (300, (None, None)),
            (400, (Some("sh -c run-b"), None)),
            (500, (Some("python3 worker.py"), Some("build-agent"))),
            (600, (Some("foreman worker --name build-agent"), Some("scan-agent"))),
        ]));
        let liveness = Liveness::new(
            Arc::new(procs),
            Arc::new(FixedClock::new(now)),
            Duration::from_secs(300),
        );
        let mut record = AgentRecord::new("build-agent", status, now - chrono::Duration::seconds(age_secs));
        record.pid = pid;
        record.command_line = Some("sh -c run-b".into());

        assert_eq!(liveness.assess(&record), expected);
    }
}
