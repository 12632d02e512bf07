use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Task queue and supervisor for a fleet of worker agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the TOML config file
    #[arg(long, global = true, env = "FOREMAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the state directory
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a task to the queue
    Enqueue {
        /// Task type (routes the task to an executor)
        #[arg(long = "type")]
        task_type: String,

        /// What the task is about
        #[arg(long)]
        desc: String,

        /// 1 (lowest) to 10 (highest)
        #[arg(long, default_value_t = 5)]
        priority: u8,

        /// Task ids that must complete first
        #[arg(long, value_delimiter = ',')]
        depends: Vec<String>,

        /// Explicit task id; enqueueing an existing id is a no-op
        #[arg(long)]
        id: Option<String>,

        /// Pre-assign the task to one agent
        #[arg(long)]
        assign: Option<String>,
    },

    /// Show queue and agent summaries
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Inspect and control agents
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },

    /// Requeue stuck work and dead-letter exhausted failures
    Rebalance,

    /// Run the generic worker driver
    Worker {
        /// Agent name to register as
        #[arg(long, env = "FOREMAN_AGENT_NAME")]
        name: String,

        /// Task types to take (default: every configured executor)
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,

        /// Run one iteration and exit
        #[arg(long)]
        once: bool,
    },

    /// Run the supervisor sweep loop (revive, zombie scan, rebalance)
    Supervise {
        /// Run one pass and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
pub enum AgentsAction {
    /// List known agents with their liveness
    List {
        #[arg(long)]
        json: bool,
    },

    /// Relaunch an agent if it is not alive
    Revive { name: String },

    /// Stop an agent (SIGTERM, then SIGKILL after a grace period)
    Stop { name: String },
}
