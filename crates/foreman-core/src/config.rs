//! Fleet configuration: defaults, then an optional TOML file, then
//! `FOREMAN_*` environment variables, then validation.
//!
//! ```toml
//! state_dir = "/var/lib/foreman"
//! poll_interval_secs = 10
//! escalation_trigger = "both"
//!
//! [executors]
//! build = ["make", "-C", "/srv/app"]
//! scan = "scripts/scan.sh --quick"
//!
//! [agents.build-agent]
//! command = ["foreman", "worker", "--name", "build-agent", "--capabilities", "build"]
//! capabilities = ["build"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ExecutorError};
use crate::escalation::{EscalationPolicy, EscalationTrigger};
use crate::executor::{CommandExecutor, ExecutorRegistry};
use crate::queue::Backoff;
use crate::supervisor::AgentLaunch;

const MAX_WINDOW_SECS: u64 = 365 * 24 * 3_600;

/// A command as either an argv list or one shell string (run with `sh -c`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandLine {
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandLine::Argv(argv) => argv.clone(),
            CommandLine::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            CommandLine::Argv(argv) => argv.is_empty(),
            CommandLine::Shell(line) => line.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub command: CommandLine,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub state_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub liveness_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub lock_timeout_ms: u64,
    pub max_concurrency: usize,
    pub load_threshold: f64,
    pub failure_window_secs: u64,
    pub failure_threshold: u32,
    pub escalation_trigger: EscalationTrigger,
    pub overload_threshold: usize,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub restart_log_limit: usize,
    pub keep_finished: usize,
    pub max_retries: u32,
    pub debug_agent: String,
    pub executors: BTreeMap<String, CommandLine>,
    pub agents: BTreeMap<String, AgentConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".foreman"),
            poll_interval_secs: 30,
            liveness_timeout_secs: 300,
            sweep_interval_secs: 30,
            lock_timeout_ms: 5_000,
            max_concurrency: 1,
            load_threshold: 8.0,
            failure_window_secs: 3_600,
            failure_threshold: 3,
            escalation_trigger: EscalationTrigger::Window,
            overload_threshold: 3,
            backoff_base_secs: 5,
            backoff_cap_secs: 300,
            restart_log_limit: 100,
            keep_finished: 500,
            max_retries: 3,
            debug_agent: "debug-agent".to_string(),
            executors: BTreeMap::new(),
            agents: BTreeMap::new(),
        }
    }
}

impl FleetConfig {
    /// Defaults overlaid with `path` (if given), then with the environment,
    /// then validated. A `path` that cannot be read is an error.
    pub fn load(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(dir) = env("FOREMAN_STATE_DIR").filter(|d| !d.is_empty()) {
            self.state_dir = PathBuf::from(dir);
        }
        override_from(&env, "FOREMAN_POLL_INTERVAL_SECS", &mut self.poll_interval_secs)?;
        override_from(&env, "FOREMAN_LIVENESS_TIMEOUT_SECS", &mut self.liveness_timeout_secs)?;
        override_from(&env, "FOREMAN_SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs)?;
        override_from(&env, "FOREMAN_LOCK_TIMEOUT_MS", &mut self.lock_timeout_ms)?;
        override_from(&env, "FOREMAN_MAX_CONCURRENCY", &mut self.max_concurrency)?;
        override_from(&env, "FOREMAN_LOAD_THRESHOLD", &mut self.load_threshold)?;
        override_from(&env, "FOREMAN_FAILURE_WINDOW_SECS", &mut self.failure_window_secs)?;
        override_from(&env, "FOREMAN_FAILURE_THRESHOLD", &mut self.failure_threshold)?;
        override_from(&env, "FOREMAN_ESCALATION_TRIGGER", &mut self.escalation_trigger)?;
        override_from(&env, "FOREMAN_OVERLOAD_THRESHOLD", &mut self.overload_threshold)?;
        override_from(&env, "FOREMAN_MAX_RETRIES", &mut self.max_retries)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        };
        if self.state_dir.as_os_str().is_empty() {
            return invalid("state_dir", "must not be empty");
        }
        if self.poll_interval_secs == 0 {
            return invalid("poll_interval_secs", "must be greater than 0");
        }
        if self.sweep_interval_secs == 0 {
            return invalid("sweep_interval_secs", "must be greater than 0");
        }
        if self.liveness_timeout_secs == 0 {
            return invalid("liveness_timeout_secs", "must be greater than 0");
        }
        if self.liveness_timeout_secs < self.poll_interval_secs {
            return invalid(
                "liveness_timeout_secs",
                "must be at least poll_interval_secs, or every idle agent looks dead",
            );
        }
        if self.lock_timeout_ms == 0 {
            return invalid("lock_timeout_ms", "must be greater than 0");
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency", "must be at least 1");
        }
        if !self.load_threshold.is_finite() || self.load_threshold <= 0.0 {
            return invalid("load_threshold", "must be a positive number");
        }
        if self.failure_window_secs == 0 || self.failure_window_secs > MAX_WINDOW_SECS {
            return invalid("failure_window_secs", "must be between 1 second and 365 days");
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold", "must be at least 1");
        }
        if self.overload_threshold == 0 {
            return invalid("overload_threshold", "must be at least 1");
        }
        if self.backoff_base_secs == 0 || self.backoff_cap_secs < self.backoff_base_secs {
            return invalid("backoff_cap_secs", "base must be > 0 and cap must be >= base");
        }
        if self.debug_agent.trim().is_empty() {
            return invalid("debug_agent", "must not be empty");
        }
        if let Some((ty, _)) = self.executors.iter().find(|(_, cmd)| cmd.is_empty()) {
            return invalid(&format!("executors.{ty}"), "command must not be empty");
        }
        if let Some((name, _)) = self.agents.iter().find(|(_, a)| a.command.is_empty()) {
            return invalid(&format!("agents.{name}.command"), "must not be empty");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_cap_secs),
        )
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            trigger: self.escalation_trigger,
            threshold: self.failure_threshold,
            window: chrono::Duration::seconds(self.failure_window_secs.min(MAX_WINDOW_SECS) as i64),
            debug_agent: self.debug_agent.clone(),
        }
    }

    pub fn agent_launches(&self) -> BTreeMap<String, AgentLaunch> {
        self.agents
            .iter()
            .map(|(name, agent)| {
                (
                    name.clone(),
                    AgentLaunch {
                        command: agent.command.argv(),
                        capabilities: agent.capabilities.clone(),
                    },
                )
            })
            .collect()
    }

    /// One `CommandExecutor` per `[executors]` entry.
    pub fn executor_registry(&self) -> Result<ExecutorRegistry, ExecutorError> {
        let mut registry = ExecutorRegistry::new();
        for (task_type, command) in &self.executors {
            registry.register(
                task_type.clone(),
                Arc::new(CommandExecutor::new(task_type.clone(), command.argv())),
            )?;
        }
        Ok(registry)
    }
}

fn override_from<T>(env: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = env(key) else {
        return Ok(());
    };
    *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = FleetConfig::load(None, env(&[])).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.liveness_timeout(), Duration::from_secs(300));
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.escalation_policy().window, chrono::Duration::hours(1));
        assert_eq!(config.escalation_policy().threshold, 3);
        assert_eq!(config.backoff().max_delay, Duration::from_secs(300));
    }

    #[test]
    fn file_then_env_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
poll_interval_secs = 10
escalation_trigger = "consecutive"

[executors]
build = ["make", "all"]
scan = "scripts/scan.sh --quick"

[agents.build-agent]
command = ["foreman", "worker", "--name", "build-agent"]
capabilities = ["build"]
"#
        )
        .unwrap();

        let config = FleetConfig::load(
            Some(file.path()),
            env(&[("FOREMAN_POLL_INTERVAL_SECS", "15"), ("FOREMAN_ESCALATION_TRIGGER", "both")]),
        )
        .unwrap();

        assert_eq!(config.poll_interval_secs, 15);
        assert_eq!(config.escalation_trigger, EscalationTrigger::Both);
        assert_eq!(config.executors["scan"].argv(), vec!["sh", "-c", "scripts/scan.sh --quick"]);
        assert_eq!(config.executor_registry().unwrap().task_types().len(), 2);

        let launches = config.agent_launches();
        assert_eq!(launches["build-agent"].command[0], "foreman");
        assert!(launches["build-agent"].capabilities.contains("build"));
    }

    #[rstest]
    #[case("FOREMAN_MAX_CONCURRENCY", "0", "max_concurrency")]
    #[case("FOREMAN_LOAD_THRESHOLD", "-1", "load_threshold")]
    #[case("FOREMAN_FAILURE_THRESHOLD", "0", "failure_threshold")]
    #[case("FOREMAN_LIVENESS_TIMEOUT_SECS", "5", "liveness_timeout_secs")]
    #[case("FOREMAN_POLL_INTERVAL_SECS", "soon", "FOREMAN_POLL_INTERVAL_SECS")]
    #[case("FOREMAN_ESCALATION_TRIGGER", "sometimes", "FOREMAN_ESCALATION_TRIGGER")]
    fn bad_values_are_fatal(#[case] key: &str, #[case] value: &str, #[case] reported: &str) {
        let err = FleetConfig::load(None, env(&[(key, value)])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, reported),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_or_malformed_file_is_reported() {
        let err = FleetConfig::load(Some(Path::new("/no/such/foreman.toml")), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "poll_interval_secs = \"often\"").unwrap();
        let err = FleetConfig::load(Some(file.path()), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
