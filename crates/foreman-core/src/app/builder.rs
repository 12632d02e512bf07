//! FleetBuilder - 構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 設定の検証と、期待される task type が
//!   executor として登録されているかのチェック
//! - ports (Clock / IdGenerator / ProcessControl) はテスト用に差し替え可能

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::app::status::{AgentRow, FleetStatus};
use crate::app::{SupervisorLoop, WorkerLoop};
use crate::config::FleetConfig;
use crate::error::{ConfigError, ForemanError};
use crate::escalation::{Backpressure, FailureTracker, Rebalancer};
use crate::executor::ExecutorRegistry;
use crate::ports::{Clock, IdGenerator, OsProcesses, ProcessControl, SystemClock, UlidGenerator};
use crate::queue::Dispatcher;
use crate::store::Stores;
use crate::supervisor::{AgentSupervisor, Verdict};

/// Builds a [`Fleet`] from a [`FleetConfig`].
///
/// # 使用例
/// ```ignore
/// let fleet = FleetBuilder::new(config)
///     .expect_task_types(&["build", "scan"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - build() は最初に FleetConfig::validate() を呼ぶ
/// - expect_task_types() で設定した type が executor に無ければ
///   ConfigError::MissingTaskTypes を返す
pub struct FleetBuilder {
    config: FleetConfig,
    processes: Option<Arc<dyn ProcessControl>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    executors: Option<ExecutorRegistry>,
    expected_types: Option<Vec<String>>,
}

impl FleetBuilder {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config,
            processes: None,
            clock: None,
            ids: None,
            executors: None,
            expected_types: None,
        }
    }

    pub fn processes(mut self, processes: Arc<dyn ProcessControl>) -> Self {
        self.processes = Some(processes);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Use these executors instead of the `[executors]` table.
    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn expect_task_types(mut self, task_types: &[&str]) -> Self {
        self.expected_types = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Fleet, ForemanError> {
        let config = self.config;
        config.validate()?;

        let executors = match self.executors {
            Some(executors) => executors,
            None => config.executor_registry()?,
        };
        if let Some(expected) = &self.expected_types {
            let missing: Vec<String> = expected.iter().filter(|t| !executors.supports(t)).cloned().collect();
            if !missing.is_empty() {
                return Err(ConfigError::MissingTaskTypes(missing).into());
            }
        }

        let processes = self.processes.unwrap_or_else(|| Arc::new(OsProcesses));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));

        let stores = Stores::open(&config.state_dir, config.lock_timeout());
        let tracker = Arc::new(FailureTracker::new(
            stores.failures.clone(),
            clock.clone(),
            config.escalation_policy(),
        ));
        let dispatcher = Arc::new(
            Dispatcher::new(stores.tasks.clone(), stores.dead_letter.clone(), ids, clock.clone())
                .with_escalation(tracker)
                .with_max_retries(config.max_retries)
                .with_keep_finished(config.keep_finished),
        );
        let supervisor = Arc::new(
            AgentSupervisor::new(
                &stores,
                processes.clone(),
                clock.clone(),
                config.liveness_timeout(),
                config.lock_timeout(),
            )
            .with_launches(config.agent_launches())
            .with_restart_log_limit(config.restart_log_limit),
        );
        let rebalancer = Arc::new(Rebalancer::new(
            dispatcher.clone(),
            supervisor.clone(),
            config.overload_threshold,
        ));
        let backpressure = Arc::new(
            Backpressure::new(processes, config.max_concurrency, config.load_threshold).with_backoff(config.backoff()),
        );

        Ok(Fleet {
            config,
            stores,
            clock,
            dispatcher,
            supervisor,
            rebalancer,
            backpressure,
            executors,
        })
    }
}

/// Every component of one fleet, wired against one state directory.
pub struct Fleet {
    config: FleetConfig,
    stores: Stores,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<AgentSupervisor>,
    rebalancer: Arc<Rebalancer>,
    backpressure: Arc<Backpressure>,
    executors: ExecutorRegistry,
}

impl Fleet {
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn supervisor(&self) -> &Arc<AgentSupervisor> {
        &self.supervisor
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    pub fn backpressure(&self) -> &Arc<Backpressure> {
        &self.backpressure
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// A worker for `name` restricted to `capabilities` (all executors when
    /// empty). Every declared capability must have an executor.
    pub fn worker(&self, name: &str, capabilities: &BTreeSet<String>) -> Result<WorkerLoop, ConfigError> {
        let missing: Vec<String> = capabilities
            .iter()
            .filter(|c| !self.executors.supports(c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingTaskTypes(missing));
        }
        let mut executors = self.executors.clone();
        executors.retain_capabilities(capabilities);
        if executors.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "executors".to_string(),
                message: "no executors configured, the worker could not run anything".to_string(),
            });
        }
        Ok(WorkerLoop::new(
            name,
            self.dispatcher.clone(),
            self.supervisor.registry().clone(),
            Arc::new(executors),
            self.backpressure.clone(),
            self.config.poll_interval(),
        ))
    }

    pub fn supervisor_loop(&self) -> SupervisorLoop {
        SupervisorLoop::new(
            self.supervisor.clone(),
            self.rebalancer.clone(),
            self.config.sweep_interval(),
        )
    }

    /// One row per known agent (registered or configured).
    pub fn agent_rows(&self) -> Vec<AgentRow> {
        let now = self.clock.now();
        let records: BTreeMap<String, _> = self
            .supervisor
            .registry()
            .list()
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        self.supervisor
            .known_agents()
            .iter()
            .map(|name| {
                let record = records.get(name);
                let verdict = record.map_or(Verdict::Unregistered, |r| self.supervisor.liveness().assess(r));
                AgentRow::new(name, record, &verdict, self.supervisor.restart_count(name), now)
            })
            .collect()
    }

    pub fn status(&self) -> FleetStatus {
        let tasks = self.dispatcher.snapshot();
        let dead_letter = self.stores.dead_letter.load().tasks.len();
        FleetStatus::summarize(&tasks, dead_letter, self.agent_rows())
    }
}
