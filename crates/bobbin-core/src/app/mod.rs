//! App - アプリケーション層
//!
//! ports を組み合わせて queue の API を実装します。
//!
//! # 主要コンポーネント
//! - **Queue**: job の追加、queue 全体の pause/resume、問い合わせ（control plane）
//! - **Worker**: claim→process→settle ループと local pause（execution plane）
//! - **QueueEvents**: event log を順番どおり listener に配送
//! - **Processor / ProcessorRegistry**: job を実行するユーザーコード

pub mod processor;
pub mod queue;
pub mod queue_events;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use self::processor::{Processor, ProcessorFn, ProcessorRegistry, processor_fn};
pub use self::queue::Queue;
pub use self::queue_events::{ListenerId, QueueEvents};
pub use self::worker::{Worker, WorkerOptions};
