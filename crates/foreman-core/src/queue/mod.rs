//! Task queue: the dispatcher, the dependency graph, and backoff.

mod backoff;
mod dependency;
mod dispatcher;

pub use backoff::Backoff;
pub use dependency::DependencyGraph;
pub use dispatcher::{Dispatcher, PRIORITY_RANGE, Reported};
