//! IdGenerator port - lock token / worker id の生成
//!
//! 分散した worker 同士で調整せずに一意な token を作るため ULID を使います。

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::{LockToken, WorkerId};
use crate::ports::Clock;

/// IdGenerator は worker が使う ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数 task から使える）
pub trait IdGenerator: Send + Sync {
    /// Claim ごとに新しい lock token を生成
    fn generate_lock_token(&self) -> LockToken;

    fn generate_worker_id(&self) -> WorkerId;
}

/// UlidGenerator は Clock の時刻 + 乱数で ULID を生成
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now_ms().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_lock_token(&self) -> LockToken {
        LockToken::from(self.next_ulid())
    }

    fn generate_worker_id(&self) -> WorkerId {
        WorkerId::from(self.next_ulid())
    }
}
