//! foreman-core
//!
//! Coordination layer for a fleet of long-running worker agents sharing one
//! task queue on the local file system.
//!
//! # モジュール構成
//! - **domain**: 永続化されるデータモデル（Task, AgentRecord, 履歴ドキュメント）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, ProcessControl）
//! - **store**: Durable Store と Lock Manager（flock + atomic JSON documents）
//! - **queue**: Task Dispatcher（claim protocol, dependency graph, backoff）
//! - **supervisor**: Agent Supervisor（registry, liveness, revive, stop）
//! - **escalation**: 失敗エスカレーション、backpressure、rebalance
//! - **executor**: task type ごとの実行器
//! - **app**: ワイヤリングとループ（FleetBuilder, WorkerLoop, SupervisorLoop, status）
//! - **config**: FleetConfig
//! - **error**: エラー型

#[cfg(not(unix))]
compile_error!("foreman-core relies on flock, signals and /proc and only supports unix hosts");

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod ports;
pub mod queue;
pub mod store;
pub mod supervisor;
