//! Processor - job を実行するユーザーコード
//!
//! Worker は 1 つの `Processor` を受け取ります。複数の job name を扱う場合は
//! `ProcessorRegistry` で name ごとに振り分けます。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Job, JobError};
use crate::error::BobbinError;

/// Executes one job. `Ok` completes it with the returned value, `Err` drives the
/// retry policy.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: Job) -> Result<Value, JobError>;
}

/// Closure adapter built by [`processor_fn`].
pub struct ProcessorFn<F> {
    f: F,
}

/// Wrap an async closure as a `Processor`.
///
/// ```ignore
/// let processor = processor_fn(|job: Job| async move { Ok(job.data) });
/// ```
pub fn processor_fn<F, Fut>(f: F) -> ProcessorFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    ProcessorFn { f }
}

#[async_trait]
impl<F, Fut> Processor for ProcessorFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    async fn process(&self, job: Job) -> Result<Value, JobError> {
        (self.f)(job).await
    }
}

/// Registry of processors (job name -> processor).
///
/// Built during initialization, then shared immutably by the worker.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) -> Result<(), BobbinError> {
        let name = name.into();
        if self.processors.contains_key(&name) {
            return Err(BobbinError::DuplicateProcessor(name));
        }
        self.processors.insert(name, processor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Processor>> {
        self.processors.get(name)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[async_trait]
impl Processor for ProcessorRegistry {
    async fn process(&self, job: Job) -> Result<Value, JobError> {
        // 未登録の name は何度やっても失敗する
        let processor = self.processors.get(&job.name).cloned().ok_or_else(|| {
            JobError::permanent(format!("no processor registered for job name={}", job.name))
        })?;
        processor.process(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, JobId, JobOptions, NewJob};
    use serde_json::json;

    fn job(name: &str) -> Job {
        Job::new(
            JobId::from(1),
            NewJob::new(name, json!({"n": 2}), JobOptions::default()),
            0,
        )
    }

    struct Double;

    #[async_trait]
    impl Processor for Double {
        async fn process(&self, job: Job) -> Result<Value, JobError> {
            let n = job.data["n"].as_i64().ok_or("n missing")?;
            Ok(json!(n * 2))
        }
    }

    #[tokio::test]
    async fn closure_processor_runs() {
        let processor = processor_fn(|job: Job| async move { Ok(job.data) });
        let out = processor.process(job("echo")).await.unwrap();
        assert_eq!(out, json!({"n": 2}));
    }

    #[tokio::test]
    async fn registry_routes_by_name() {
        let mut registry = ProcessorRegistry::new();
        registry.register("double", Arc::new(Double)).unwrap();

        let out = registry.process(job("double")).await.unwrap();
        assert_eq!(out, json!(4));
    }

    #[tokio::test]
    async fn registry_fails_permanently_when_name_missing() {
        let registry = ProcessorRegistry::new();
        let err = registry.process(job("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.message().contains("missing"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ProcessorRegistry::new();
        registry.register("double", Arc::new(Double)).unwrap();
        let err = registry.register("double", Arc::new(Double)).unwrap_err();
        assert!(matches!(err, BobbinError::DuplicateProcessor(name) if name == "double"));
        assert_eq!(registry.len(), 1);
    }
}
