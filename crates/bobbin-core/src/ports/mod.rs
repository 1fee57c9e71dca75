//! Ports - 抽象化レイヤー
//!
//! 外部システム（共有ストア、時刻、ID 生成）へのインターフェースを定義します。
//! 実装は `impls` にあります。

pub mod clock;
pub mod id_generator;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::store::{JobCounts, JobStore, StalledJobs, StoreError};
