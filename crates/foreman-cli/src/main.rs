mod cli;

use std::collections::BTreeSet;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use foreman_core::app::{AgentTable, Fleet, FleetBuilder, Tick};
use foreman_core::config::FleetConfig;
use foreman_core::domain::NewTask;
use foreman_core::error::{
    ConfigError, DispatchError, ForemanError, LockError, SpawnError, StoreError,
};
use foreman_core::supervisor::RestartOutcome;

use crate::cli::{AgentsAction, Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            if code == 4 {
                eprintln!("busy, try again: {e:#}");
            } else {
                eprintln!("error: {e:#}");
            }
            ExitCode::from(code)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = FleetConfig::load(cli.config.as_deref(), |key| std::env::var(key).ok())
        .context("loading configuration")?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    let fleet = FleetBuilder::new(config).build()?;

    match cli.command {
        Commands::Enqueue {
            task_type,
            desc,
            priority,
            depends,
            id,
            assign,
        } => cmd_enqueue(&fleet, task_type, desc, priority, depends, id, assign),
        Commands::Status { json } => cmd_status(&fleet, json),
        Commands::Agents { action } => cmd_agents(&fleet, action),
        Commands::Rebalance => cmd_rebalance(&fleet),
        Commands::Worker {
            name,
            capabilities,
            once,
        } => cmd_worker(&fleet, &name, capabilities, once).await,
        Commands::Supervise { once } => cmd_supervise(&fleet, once).await,
    }
}

fn cmd_enqueue(
    fleet: &Fleet,
    task_type: String,
    desc: String,
    priority: u8,
    depends: Vec<String>,
    id: Option<String>,
    assign: Option<String>,
) -> Result<()> {
    let mut new = NewTask::new(task_type, desc)
        .priority(priority)
        .depends_on(depends.into_iter().filter(|d| !d.trim().is_empty()));
    if let Some(id) = id {
        new = new.with_id(id);
    }
    if let Some(agent) = assign {
        new = new.assigned_to(agent);
    }
    let id = fleet.dispatcher().enqueue(new)?;
    println!("{id}");
    Ok(())
}

fn cmd_status(fleet: &Fleet, json: bool) -> Result<()> {
    let status = fleet.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{status}");
    }
    Ok(())
}

fn cmd_agents(fleet: &Fleet, action: AgentsAction) -> Result<()> {
    let supervisor = fleet.supervisor();
    match action {
        AgentsAction::List { json } => {
            let rows = fleet.agent_rows();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", AgentTable(&rows));
            }
        }
        AgentsAction::Revive { name } => match supervisor.revive_if_dead(&name)? {
            RestartOutcome::Alive => println!("{name} is alive"),
            RestartOutcome::Restarted {
                old_pid,
                new_pid,
                restart_count,
            } => {
                let old = old_pid.map_or_else(|| "-".to_string(), |p| p.to_string());
                println!("{name} restarted: pid {old} -> {new_pid} (restart #{restart_count})");
            }
            RestartOutcome::NoLaunchCommand => {
                return Err(SpawnError::NoLaunchCommand(name).into());
            }
        },
        AgentsAction::Stop { name } => {
            let outcome = supervisor.stop_agent(&name)?;
            match (outcome.pid, outcome.killed) {
                (Some(pid), true) => println!("{name} stopped (pid {pid} killed)"),
                (Some(pid), false) => println!("{name} stopped (pid {pid} terminated)"),
                (None, _) => println!("{name} marked stopped (no running process)"),
            }
        }
    }
    Ok(())
}

fn cmd_rebalance(fleet: &Fleet) -> Result<()> {
    let report = fleet.rebalancer().run()?;
    for (id, reason) in &report.requeued {
        println!("requeued {id}: {reason}");
    }
    for id in &report.abandoned {
        println!("dead-lettered {id}");
    }
    for id in &report.escalated {
        println!("enqueued pending debug task {id}");
    }
    if report.requeued.is_empty() && report.abandoned.is_empty() && report.escalated.is_empty() {
        println!("nothing to rebalance");
    }
    Ok(())
}

async fn cmd_worker(fleet: &Fleet, name: &str, capabilities: Vec<String>, once: bool) -> Result<()> {
    let capabilities: BTreeSet<String> = capabilities
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    let worker = fleet.worker(name, &capabilities)?;

    if once {
        match worker.run_once().await? {
            Tick::Executed { task_id, success, .. } => {
                println!("{task_id} {}", if success { "completed" } else { "failed" });
            }
            Tick::Idle => println!("no claimable task"),
            Tick::Deferred(pressure) => println!("deferred: {pressure}"),
        }
        return Ok(());
    }

    let shutdown = shutdown_signal();
    worker.run(shutdown).await?;
    Ok(())
}

async fn cmd_supervise(fleet: &Fleet, once: bool) -> Result<()> {
    let supervisor = fleet.supervisor_loop();
    if once {
        let report = supervisor.pass().await;
        let sweep = &report.sweep;
        println!(
            "checked {} alive {} restarted {} failed {} zombies {}",
            sweep.checked,
            sweep.alive,
            sweep.restarted.len(),
            sweep.failed.len(),
            sweep.zombies.len()
        );
        if let Some(rebalance) = &report.rebalance {
            println!(
                "requeued {} dead-lettered {}",
                rebalance.requeued.len(),
                rebalance.abandoned.len()
            );
        }
        return Ok(());
    }

    supervisor.run(shutdown_signal()).await;
    Ok(())
}

/// Flips to true on SIGINT or SIGTERM.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(term) => Some(term),
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                None
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
            Some(_) = async {
                match term.as_mut() {
                    Some(term) => term.recv().await,
                    None => std::future::pending().await,
                }
            } => info!("SIGTERM received, shutting down"),
        }
        let _ = tx.send(true);
        // keep the sender alive so receivers see `true` rather than a closed channel
        std::future::pending::<()>().await;
    });
    rx
}

/// Stable exit code per failure kind.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ForemanError>() {
            return match e {
                ForemanError::Store(e) => store_code(e),
                ForemanError::Dispatch(e) => dispatch_code(e),
                ForemanError::Spawn(_) => 9,
                ForemanError::Config(_) => 3,
                ForemanError::AgentNotFound(_) => 7,
                ForemanError::Executor(_) | ForemanError::Join(_) => 1,
            };
        }
        if let Some(e) = cause.downcast_ref::<DispatchError>() {
            return dispatch_code(e);
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return store_code(e);
        }
        if cause.downcast_ref::<LockError>().is_some() {
            return 4;
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return 3;
        }
        if cause.downcast_ref::<SpawnError>().is_some() {
            return 9;
        }
    }
    1
}

fn store_code(err: &StoreError) -> u8 {
    match err {
        StoreError::Lock(LockError::Timeout { .. }) => 4,
        StoreError::Lock(LockError::Io { .. }) | StoreError::Write { .. } => 5,
        StoreError::StaleRead { .. } => 6,
    }
}

fn dispatch_code(err: &DispatchError) -> u8 {
    match err {
        DispatchError::Store(e) => store_code(e),
        DispatchError::NotFound(_) => 7,
        DispatchError::InvalidTransition { .. }
        | DispatchError::NotOwner { .. }
        | DispatchError::UnknownDependency(_)
        | DispatchError::InvalidPriority(_) => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::domain::TaskId;
    use std::time::Duration;

    #[test]
    fn exit_codes_follow_the_failure_kind() {
        let timeout = StoreError::Lock(LockError::Timeout {
            resource: "tasks".into(),
            waited: Duration::from_secs(5),
        });
        assert_eq!(exit_code(&anyhow::Error::new(timeout)), 4);

        let unknown = DispatchError::UnknownDependency(TaskId::from("t9"));
        assert_eq!(exit_code(&anyhow::Error::new(unknown)), 8);

        let missing = ForemanError::AgentNotFound("ghost".into());
        assert_eq!(exit_code(&anyhow::Error::new(missing)), 7);

        let spawn = SpawnError::NoLaunchCommand("build-agent".into());
        assert_eq!(exit_code(&anyhow::Error::new(spawn)), 9);

        let config = ConfigError::MissingTaskTypes(vec!["scan".into()]);
        let wrapped = anyhow::Error::new(config).context("loading configuration");
        assert_eq!(exit_code(&wrapped), 3);

        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
