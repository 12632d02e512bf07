//! WorkerLoop - タスク実行ループ
//!
//! The one generic worker driver: every agent runs this loop with its own
//! executors.
//!
//! # フロー
//! 1. Backpressure check; on pressure flag the next task as throttled and
//!    back off exponentially
//! 2. Dispatcher::next_claimable_matching() で claim
//! 3. Executor 実行（heartbeat は実行中も続ける）
//! 4. Dispatcher::report_outcome() で結果を記録
//!
//! Store, registry and process-table calls block on file locks, so they run
//! on the blocking pool. A result the dispatcher could not accept is kept and
//! delivered before anything new is claimed.
//!
//! Shutdown is a `watch` channel. Whatever way the loop exits, the agent is
//! marked `stopped` on the way out, and the rebalancer recovers any task whose
//! result was never delivered.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::domain::{AgentStatus, TaskId};
use crate::error::ForemanError;
use crate::escalation::{Backpressure, Pressure};
use crate::executor::{ExecutorRegistry, TaskRequest};
use crate::queue::Dispatcher;
use crate::supervisor::AgentRegistry;

/// What one iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Executed {
        task_id: TaskId,
        success: bool,
        debug_task: Option<TaskId>,
    },
    Idle,
    Deferred(Pressure),
}

/// An execution result not yet accepted by the dispatcher.
#[derive(Debug, Clone)]
struct Unreported {
    task_id: TaskId,
    success: bool,
    notes: Option<String>,
}

pub struct WorkerLoop {
    name: String,
    capabilities: BTreeSet<String>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<AgentRegistry>,
    executors: Arc<ExecutorRegistry>,
    backpressure: Arc<Backpressure>,
    poll_interval: Duration,
    unreported: Mutex<Option<Unreported>>,
}

impl WorkerLoop {
    pub fn new(
        name: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<AgentRegistry>,
        executors: Arc<ExecutorRegistry>,
        backpressure: Arc<Backpressure>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: executors.task_types(),
            dispatcher,
            registry,
            executors,
            backpressure,
            poll_interval,
            unreported: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register, then poll until `shutdown` flips to true (or its sender is
    /// dropped). In-flight executions finish before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ForemanError> {
        let _stopped = self.start()?;

        let mut deferrals: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = match self.tick().await {
                Ok(Tick::Executed { .. }) => {
                    deferrals = 0;
                    Duration::ZERO
                }
                Ok(Tick::Idle) => {
                    deferrals = 0;
                    self.poll_interval
                }
                Ok(Tick::Deferred(pressure)) => {
                    deferrals = deferrals.saturating_add(1);
                    let delay = self.backpressure.delay_for(deferrals);
                    info!(agent = %self.name, %pressure, ?delay, "backing off");
                    delay
                }
                Err(e) if e.is_retryable() => {
                    warn!(agent = %self.name, error = %e, "transient error, will retry");
                    self.poll_interval
                }
                Err(e) => {
                    error!(agent = %self.name, error = %e, "worker iteration failed");
                    self.poll_interval
                }
            };
            if wait.is_zero() {
                continue;
            }
            if self.idle_for(wait, &mut shutdown).await {
                break;
            }
        }
        info!(agent = %self.name, "worker stopping");
        Ok(())
    }

    /// Register, run a single iteration, and stop.
    pub async fn run_once(&self) -> Result<Tick, ForemanError> {
        let _stopped = self.start()?;
        self.tick().await
    }

    fn start(&self) -> Result<StoppedGuard, ForemanError> {
        let command_line = std::env::args_os()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        self.registry.register_instance(
            &self.name,
            std::process::id(),
            Some(command_line),
            &self.capabilities,
        )?;
        info!(agent = %self.name, types = ?self.capabilities, "worker started");
        Ok(StoppedGuard {
            registry: self.registry.clone(),
            name: self.name.clone(),
        })
    }

    /// One iteration: check limits, claim, execute, report. A result still
    /// owed from an earlier iteration is reported first, and nothing new is
    /// claimed until it goes through.
    pub async fn tick(&self) -> Result<Tick, ForemanError> {
        if let Some(owed) = self.take_unreported() {
            debug!(agent = %self.name, task_id = %owed.task_id, "retrying report");
            return self.report(owed).await;
        }

        let executors = self.executors.clone();
        let accepts = move |ty: &str| executors.supports(ty);

        let pressure = {
            let backpressure = self.backpressure.clone();
            let name = self.name.clone();
            blocking(move || Ok(backpressure.check(&name))).await?
        };
        if !pressure.is_clear() {
            let (dispatcher, registry, name) = self.handles();
            let accepts = accepts.clone();
            blocking(move || {
                dispatcher.defer(&name, &accepts)?;
                registry.heartbeat(&name, AgentStatus::Idle, None)?;
                Ok(())
            })
            .await?;
            return Ok(Tick::Deferred(pressure));
        }

        let (dispatcher, registry, name) = self.handles();
        let claimed = blocking(move || {
            let Some(task) = dispatcher.next_claimable_matching(&name, &accepts)? else {
                registry.heartbeat(&name, AgentStatus::Available, None)?;
                return Ok(None);
            };
            registry.heartbeat(&name, AgentStatus::Busy, Some(&task.id))?;
            Ok(Some(task))
        })
        .await?;
        let Some(task) = claimed else {
            return Ok(Tick::Idle);
        };

        let request = TaskRequest::from(&task);
        let outcome = {
            let execution = self.executors.execute(&task.task_type, &request);
            tokio::pin!(execution);
            let mut beat = time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
            loop {
                tokio::select! {
                    outcome = &mut execution => break outcome,
                    _ = beat.tick() => {
                        let (_, registry, name) = self.handles();
                        let id = task.id.clone();
                        let sent = blocking(move || Ok(registry.heartbeat(&name, AgentStatus::Busy, Some(&id))?));
                        if let Err(e) = sent.await {
                            warn!(agent = %self.name, error = %e, "heartbeat failed during execution");
                        }
                    }
                }
            }
        };
        debug!(agent = %self.name, task_id = %task.id, success = outcome.success, "execution finished");

        self.report(Unreported {
            task_id: task.id,
            success: outcome.success,
            notes: outcome.notes,
        })
        .await
    }

    /// Hand a result to the dispatcher. On a transient failure the result is
    /// kept for the next tick; a permanent rejection (the task was requeued
    /// and claimed by someone else, say) drops it.
    async fn report(&self, done: Unreported) -> Result<Tick, ForemanError> {
        let (dispatcher, registry, name) = self.handles();
        let attempt = done.clone();
        let reported = blocking(move || {
            let reported = dispatcher.report_outcome(&attempt.task_id, &name, attempt.success, attempt.notes)?;
            if attempt.success {
                registry.record_completion(&name)?;
            }
            registry.heartbeat(&name, AgentStatus::Available, None)?;
            Ok(reported)
        })
        .await;

        match reported {
            Ok(reported) => Ok(Tick::Executed {
                task_id: done.task_id,
                success: done.success,
                debug_task: reported.debug_task,
            }),
            Err(e) if e.is_retryable() => {
                if self.still_in_flight(&done.task_id).await {
                    warn!(agent = %self.name, task_id = %done.task_id, error = %e, "report failed, will retry before claiming");
                    self.keep_unreported(done);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Is `id` still ours and waiting for a result?
    async fn still_in_flight(&self, id: &TaskId) -> bool {
        let (dispatcher, _, name) = self.handles();
        let id = id.clone();
        let ours = blocking(move || {
            Ok(dispatcher
                .get(&id)
                .is_some_and(|t| !t.status.is_terminal() && t.assigned_agent.as_deref() == Some(name.as_str())))
        });
        ours.await.unwrap_or(false)
    }

    fn take_unreported(&self) -> Option<Unreported> {
        self.unreported.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn keep_unreported(&self, done: Unreported) {
        *self.unreported.lock().unwrap_or_else(PoisonError::into_inner) = Some(done);
    }

    fn handles(&self) -> (Arc<Dispatcher>, Arc<AgentRegistry>, String) {
        (self.dispatcher.clone(), self.registry.clone(), self.name.clone())
    }

    /// Sleep for `total`, heartbeating at least once per poll interval so a
    /// long backoff does not look like a dead agent. Returns true on shutdown.
    async fn idle_for(&self, total: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(self.poll_interval);
            tokio::select! {
                _ = time::sleep(slice) => {}
                changed = shutdown.changed() => {
                    // a dropped sender means nobody can ask us to keep going
                    if changed.is_err() || *shutdown.borrow() {
                        return true;
                    }
                }
            }
            if Instant::now() < deadline {
                let (_, registry, name) = self.handles();
                let sent = blocking(move || Ok(registry.heartbeat(&name, AgentStatus::Idle, None)?));
                if let Err(e) = sent.await {
                    warn!(agent = %self.name, error = %e, "heartbeat failed");
                }
            }
        }
    }
}

/// Run a store or process-table call on the blocking pool.
async fn blocking<T, F>(call: F) -> Result<T, ForemanError>
where
    F: FnOnce() -> Result<T, ForemanError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call).await?
}

/// Writes the final `stopped` status on every exit path, unwinding included.
struct StoppedGuard {
    registry: Arc<AgentRegistry>,
    name: String,
}

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        if let Err(e) = self.registry.mark_stopped(&self.name) {
            error!(agent = %self.name, error = %e, "failed to record stopped status");
        }
    }
}
