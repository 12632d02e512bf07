//! App - アプリケーション層
//!
//! このモジュールは、store / queue / supervisor / escalation を組み合わせて
//! 実際に動くループを組み立てます。
//!
//! # 主要コンポーネント
//! - **FleetBuilder**: 設定からの構築とワイヤリング
//! - **WorkerLoop**: タスク実行ループ（backpressure→claim→execute→report）
//! - **SupervisorLoop**: 生存監視と rebalance
//! - **FleetStatus**: キューと agent のサマリ

pub mod builder;
pub mod status;
pub mod supervisor_loop;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{Fleet, FleetBuilder};
pub use self::status::{AgentRow, AgentTable, FleetStatus, QueueCounts};
pub use self::supervisor_loop::{PassReport, SupervisorLoop};
pub use self::worker_loop::{Tick, WorkerLoop};
