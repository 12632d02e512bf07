//! SupervisorLoop - 生存監視ループ
//!
//! # フロー
//! 1. AgentSupervisor::sweep() で死んだ agent を再起動、zombie を記録
//! 2. Rebalancer::run() で詰まったタスクを queue に戻す
//! 3. sweep_interval 待機（shutdown で中断）
//!
//! Sweeps block on signals and file locks, so each pass runs on the
//! blocking pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::escalation::{RebalanceReport, Rebalancer};
use crate::supervisor::{AgentSupervisor, SweepReport};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub sweep: SweepReport,
    /// `None` when the rebalance failed (logged).
    pub rebalance: Option<RebalanceReport>,
}

pub struct SupervisorLoop {
    supervisor: Arc<AgentSupervisor>,
    rebalancer: Arc<Rebalancer>,
    interval: Duration,
}

impl SupervisorLoop {
    pub fn new(supervisor: Arc<AgentSupervisor>, rebalancer: Arc<Rebalancer>, interval: Duration) -> Self {
        Self {
            supervisor,
            rebalancer,
            interval,
        }
    }

    /// One sweep followed by one rebalance.
    pub async fn pass(&self) -> PassReport {
        let supervisor = self.supervisor.clone();
        let rebalancer = self.rebalancer.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let sweep = supervisor.sweep();
            let rebalance = match rebalancer.run() {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(error = %e, "rebalance failed, will retry next pass");
                    None
                }
            };
            PassReport { sweep, rebalance }
        })
        .await;

        match joined {
            Ok(report) => {
                let s = &report.sweep;
                if !s.restarted.is_empty() || !s.failed.is_empty() || !s.zombies.is_empty() {
                    info!(
                        checked = s.checked,
                        alive = s.alive,
                        restarted = s.restarted.len(),
                        failed = s.failed.len(),
                        zombies = s.zombies.len(),
                        "sweep finished"
                    );
                }
                report
            }
            Err(e) => {
                error!(error = %e, "supervisor pass panicked");
                PassReport::default()
            }
        }
    }

    /// Pass, wait, repeat until `shutdown` flips to true or its sender is
    /// dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "supervisor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.pass().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("supervisor stopping");
    }
}
