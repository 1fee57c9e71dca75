//! bobbin-core
//!
//! Job queue engine: producers add jobs, workers claim and run them, and a
//! shared store keeps every state transition atomic.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, state, backoff, events, errors）
//! - **ports**: 抽象化レイヤー（JobStore, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryStore）
//! - **app**: Queue / Worker / QueueEvents
//! - **config**: serde で読める設定
//! - **error**: crate 全体のエラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use app::{
    ListenerId, Processor, ProcessorRegistry, Queue, QueueEvents, Worker, WorkerOptions,
    processor_fn,
};
pub use config::{MemoryStoreConfig, QueueEventsConfig, WorkerConfig};
pub use domain::{
    Backoff, EventId, EventKind, EventRecord, Job, JobError, JobId, JobOptions, JobState, NewJob,
    QueueEvent,
};
pub use error::BobbinError;
pub use impls::InMemoryStore;
pub use ports::{JobCounts, JobStore, StoreError};
