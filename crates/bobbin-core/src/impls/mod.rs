//! Impls - ports の実装
//!
//! - **memory**: プロセス内で完結する `JobStore`（テスト・デモ・単一プロセス用）

pub mod memory;

pub use self::memory::InMemoryStore;
