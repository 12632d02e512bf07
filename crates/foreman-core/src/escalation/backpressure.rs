//! Backpressure: should this agent claim work right now?

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::ports::ProcessControl;
use crate::queue::Backoff;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pressure {
    Clear,
    TooManyProcesses { running: usize, max: usize },
    HighLoad { load: f64, threshold: f64 },
}

impl Pressure {
    pub fn is_clear(&self) -> bool {
        matches!(self, Pressure::Clear)
    }
}

impl fmt::Display for Pressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pressure::Clear => f.write_str("clear"),
            Pressure::TooManyProcesses { running, max } => {
                write!(f, "{running} matching processes running (max {max})")
            }
            Pressure::HighLoad { load, threshold } => {
                write!(f, "load average {load:.2} >= {threshold:.2}")
            }
        }
    }
}

pub struct Backpressure {
    processes: Arc<dyn ProcessControl>,
    max_concurrency: usize,
    load_threshold: f64,
    backoff: Backoff,
}

impl Backpressure {
    pub fn new(processes: Arc<dyn ProcessControl>, max_concurrency: usize, load_threshold: f64) -> Self {
        Self {
            processes,
            max_concurrency,
            load_threshold,
            backoff: Backoff::throttle(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Live (non-zombie) instances of `agent`, the caller included, may not
    /// exceed `max_concurrency`; the one-minute load
    /// average must stay below `load_threshold`. An unreadable load average
    /// does not block.
    pub fn check(&self, agent: &str) -> Pressure {
        let running = self
            .processes
            .snapshot()
            .iter()
            .filter(|p| !p.is_zombie() && p.runs_agent(agent))
            .count();
        if running > self.max_concurrency {
            return Pressure::TooManyProcesses {
                running,
                max: self.max_concurrency,
            };
        }
        match self.processes.load_average() {
            Some(load) if load >= self.load_threshold => Pressure::HighLoad {
                load,
                threshold: self.load_threshold,
            },
            _ => Pressure::Clear,
        }
    }

    pub fn ensure_within_limits(&self, agent: &str) -> bool {
        self.check(agent).is_clear()
    }

    /// Sleep before re-checking after `deferrals` consecutive deferrals.
    pub fn delay_for(&self, deferrals: u32) -> Duration {
        self.backoff.next_delay(deferrals)
    }
}
