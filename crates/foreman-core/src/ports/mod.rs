//! Ports - 抽象化レイヤー
//!
//! 時刻・ID 生成・OS プロセスの 3 つを trait にしておき、テストでは
//! FixedClock や fake のプロセステーブルに差し替える。

pub mod clock;
pub mod id_generator;
pub mod process;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::process::{
    AGENT_NAME_ENV, LaunchSpec, OsProcesses, ProcessControl, ProcessInfo, Signal, is_agent_process,
};
