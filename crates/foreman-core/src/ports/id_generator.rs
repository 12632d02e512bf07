//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は複数プロセスから同時に使える ID を生成
///
/// # ULID の特性
/// - 時刻でソート可能
/// - 80-bit のランダム部分があるので、同じミリ秒に複数の producer が
///   enqueue しても衝突しない
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// UlidGenerator は Clock の時刻 + ランダム suffix で ID を作る
///
/// Clock を差し替えられるので、テストでは FixedClock で timestamp 部分を固定できる。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::new(format!("{}{}", TaskId::PREFIX, ulid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);
        let ids: HashSet<TaskId> = (0..1000).map(|_| id_gen.generate_task_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn fixed_clock_ids_share_timestamp_but_differ() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();
        assert_ne!(id1, id2);

        let ulid1 = Ulid::from_string(&id1.as_str()[TaskId::PREFIX.len()..]).unwrap();
        let ulid2 = Ulid::from_string(&id2.as_str()[TaskId::PREFIX.len()..]).unwrap();
        assert_eq!(ulid1.timestamp_ms(), ulid2.timestamp_ms());
        assert_eq!(ulid1.timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn ids_carry_the_task_prefix() {
        let id = UlidGenerator::new(SystemClock).generate_task_id();
        assert!(id.as_str().starts_with("task-"));
    }
}
