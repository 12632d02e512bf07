//! ProcessControl port - OS プロセス操作の抽象化
//!
//! Liveness checks, the process-table scan, load average, signalling and
//! spawning all go through this trait so the supervisor and backpressure
//! logic can be tested with a fake process table.
//!
//! # 実装
//! - **OsProcesses**: libc + procfs (unix)

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Single-letter state from `/proc/<pid>/stat` (`R`, `S`, `Z`, ...).
    pub state: char,
    pub command_line: String,
    /// `FOREMAN_AGENT_NAME` from the process environment, when readable.
    pub agent_name: Option<String>,
}

impl ProcessInfo {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }

    pub fn runs_agent(&self, agent: &str) -> bool {
        is_agent_process(agent, None, self.agent_name.as_deref(), &self.command_line)
    }
}

/// Set on every launched agent so its instances can be recognised whatever
/// the launch command looks like.
pub const AGENT_NAME_ENV: &str = "FOREMAN_AGENT_NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// How to launch an agent in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub agent: String,
    pub command: Vec<String>,
    /// `<agent>.out` / `<agent>.err` are appended here.
    pub log_dir: PathBuf,
}

pub trait ProcessControl: Send + Sync {
    fn is_running(&self, pid: u32) -> bool;

    /// Space-joined argv, `None` when it cannot be read.
    fn command_line(&self, pid: u32) -> Option<String>;

    /// The [`AGENT_NAME_ENV`] the process was started with.
    fn agent_name(&self, _pid: u32) -> Option<String> {
        None
    }

    fn snapshot(&self) -> Vec<ProcessInfo>;

    /// One-minute load average.
    fn load_average(&self) -> Option<f64>;

    /// Start the process detached in its own process group; returns its pid.
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<u32>;

    /// Delivering to a process that is already gone is not an error.
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// Collect exited children so their pids stop looking alive.
    fn reap_children(&self) -> usize;
}

/// Is a process an instance of `agent`?
///
/// The launch environment decides when it names an agent. Otherwise the
/// process must run the command line recorded for the agent, or name the
/// agent in its argv.
pub fn is_agent_process(agent: &str, recorded: Option<&str>, env_name: Option<&str>, command_line: &str) -> bool {
    if let Some(env_name) = env_name {
        return env_name == agent;
    }
    recorded.is_some_and(|r| r == command_line) || matches_agent(command_line, agent)
}

/// Does `command_line` belong to `agent`?
///
/// Matches whole argv tokens: the bare name, a path whose file name or stem is
/// the name, or `--flag=name`. Substrings do not count, so `build-agent` does
/// not match `build-agent-2`.
pub fn matches_agent(command_line: &str, agent: &str) -> bool {
    command_line.split_whitespace().any(|token| {
        let value = token.rsplit_once('=').map_or(token, |(_, v)| v);
        if value == agent {
            return true;
        }
        let path = Path::new(value);
        path.file_name().is_some_and(|n| n == agent) || path.file_stem().is_some_and(|s| s == agent)
    })
}

/// The real process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcesses;

const PROC_ROOT: &str = "/proc";

impl OsProcesses {
    fn read_state(pid: u32) -> Option<(char, String)> {
        let stat = fs::read_to_string(format!("{PROC_ROOT}/{pid}/stat")).ok()?;
        parse_stat(&stat)
    }
}

/// `"<pid> (<comm>) <state> ..."`; comm may itself contain parentheses.
fn parse_stat(stat: &str) -> Option<(char, String)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let state = stat.get(close + 1..)?.trim_start().chars().next()?;
    Some((state, comm))
}

/// `environ` is NUL-separated `KEY=value` pairs.
fn parse_agent_name(environ: &[u8]) -> Option<String> {
    let prefix = format!("{AGENT_NAME_ENV}=");
    environ
        .split(|b| *b == 0)
        .find_map(|pair| pair.strip_prefix(prefix.as_bytes()))
        .filter(|value| !value.is_empty())
        .map(|value| String::from_utf8_lossy(value).into_owned())
}

fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    if pid == 0 {
        return None;
    }
    libc::pid_t::try_from(pid).ok()
}

impl ProcessControl for OsProcesses {
    fn is_running(&self, pid: u32) -> bool {
        let Some(raw) = to_pid_t(pid) else {
            return false;
        };
        // SAFETY: signal 0 performs permission and existence checks only.
        if unsafe { libc::kill(raw, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        let raw = fs::read(format!("{PROC_ROOT}/{pid}/cmdline")).ok()?;
        let joined = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() { None } else { Some(joined) }
    }

    fn agent_name(&self, pid: u32) -> Option<String> {
        let raw = fs::read(format!("{PROC_ROOT}/{pid}/environ")).ok()?;
        parse_agent_name(&raw)
    }

    fn snapshot(&self) -> Vec<ProcessInfo> {
        let Ok(entries) = fs::read_dir(PROC_ROOT) else {
            return Vec::new();
        };
        let mut rows = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Some((state, comm)) = Self::read_state(pid) else {
                continue;
            };
            // zombies have an empty cmdline; fall back to comm
            let command_line = self.command_line(pid).unwrap_or(comm);
            rows.push(ProcessInfo {
                pid,
                state,
                command_line,
                agent_name: self.agent_name(pid),
            });
        }
        rows
    }

    fn load_average(&self) -> Option<f64> {
        let mut loads = [0f64; 3];
        // SAFETY: the buffer holds 3 doubles, as requested.
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        if n >= 1 { Some(loads[0]) } else { None }
    }

    fn spawn(&self, spec: &LaunchSpec) -> io::Result<u32> {
        use std::os::unix::process::CommandExt;

        let Some((program, args)) = spec.command.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty launch command"));
        };
        fs::create_dir_all(&spec.log_dir)?;
        let open_log = |suffix: &str| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(spec.log_dir.join(format!("{}.{suffix}", spec.agent)))
        };
        let child = Command::new(program)
            .args(args)
            .env(AGENT_NAME_ENV, &spec.agent)
            .stdin(Stdio::null())
            .stdout(open_log("out")?)
            .stderr(open_log("err")?)
            .process_group(0)
            .spawn()?;
        // The child handle is dropped without waiting; `reap_children` collects it.
        Ok(child.id())
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let Some(raw) = to_pid_t(pid) else {
            return Ok(());
        };
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: plain kill(2) on a positive pid.
        if unsafe { libc::kill(raw, sig) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    fn reap_children(&self) -> usize {
        let mut reaped = 0;
        loop {
            // SAFETY: WNOHANG never blocks; a null status pointer is allowed.
            let result = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
            if result <= 0 {
                break;
            }
            reaped += 1;
        }
        reaped
    }
}
