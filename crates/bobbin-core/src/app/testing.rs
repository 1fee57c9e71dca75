//! Test helpers shared by the app-layer tests.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{EventId, EventRecord, Job, JobError, JobId, JobState, LockToken, NewJob};
use crate::impls::InMemoryStore;
use crate::ports::{JobCounts, JobStore, StalledJobs, StoreError};

/// Poll `check` every 10ms; panic after 3s.
pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 3s");
}

/// In-memory store whose claims, settlements and event reads fail a set
/// number of times. Claims can also be slowed down.
pub(crate) struct FlakyStore {
    inner: InMemoryStore,
    claim_failures: AtomicUsize,
    settle_failures: AtomicUsize,
    event_failures: AtomicUsize,
    claim_delay: Duration,
}

impl FlakyStore {
    pub(crate) fn new(claim_failures: usize, settle_failures: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            claim_failures: AtomicUsize::new(claim_failures),
            settle_failures: AtomicUsize::new(settle_failures),
            event_failures: AtomicUsize::new(0),
            claim_delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_event_failures(mut self, n: usize) -> Self {
        self.event_failures = AtomicUsize::new(n);
        self
    }

    /// Every `move_to_active` sleeps this long before claiming.
    pub(crate) fn with_claim_delay(mut self, delay: Duration) -> Self {
        self.claim_delay = delay;
        self
    }

    pub(crate) fn remaining_failures(&self) -> usize {
        self.claim_failures.load(Ordering::SeqCst) + self.settle_failures.load(Ordering::SeqCst)
    }

    fn trip(counter: &AtomicUsize) -> Result<(), StoreError> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn add_job(&self, queue: &str, job: NewJob) -> Result<Job, StoreError> {
        self.inner.add_job(queue, job).await
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), StoreError> {
        self.inner.set_paused(queue, paused).await
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        self.inner.is_paused(queue).await
    }

    async fn wait_for_job(&self, queue: &str, timeout: Duration) -> Result<bool, StoreError> {
        self.inner.wait_for_job(queue, timeout).await
    }

    async fn move_to_active(
        &self,
        queue: &str,
        token: LockToken,
        lock_duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        Self::trip(&self.claim_failures)?;
        if !self.claim_delay.is_zero() {
            tokio::time::sleep(self.claim_delay).await;
        }
        self.inner.move_to_active(queue, token, lock_duration).await
    }

    async fn move_to_completed(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        return_value: serde_json::Value,
    ) -> Result<Job, StoreError> {
        Self::trip(&self.settle_failures)?;
        self.inner
            .move_to_completed(queue, job_id, token, return_value)
            .await
    }

    async fn move_to_failed(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        error: &JobError,
    ) -> Result<JobState, StoreError> {
        Self::trip(&self.settle_failures)?;
        self.inner.move_to_failed(queue, job_id, token, error).await
    }

    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        duration: Duration,
    ) -> Result<bool, StoreError> {
        self.inner.extend_lock(queue, job_id, token, duration).await
    }

    async fn move_stalled_jobs_to_wait(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledJobs, StoreError> {
        self.inner
            .move_stalled_jobs_to_wait(queue, max_stalled_count)
            .await
    }

    async fn get_job(&self, queue: &str, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(queue, job_id).await
    }

    async fn get_state(
        &self,
        queue: &str,
        job_id: &JobId,
    ) -> Result<Option<JobState>, StoreError> {
        self.inner.get_state(queue, job_id).await
    }

    async fn get_counts(&self, queue: &str, states: &[JobState]) -> Result<JobCounts, StoreError> {
        self.inner.get_counts(queue, states).await
    }

    async fn get_jobs(
        &self,
        queue: &str,
        states: &[JobState],
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.get_jobs(queue, states, start, end).await
    }

    async fn remove_job(&self, queue: &str, job_id: &JobId) -> Result<bool, StoreError> {
        self.inner.remove_job(queue, job_id).await
    }

    async fn drain(&self, queue: &str, include_delayed: bool) -> Result<usize, StoreError> {
        self.inner.drain(queue, include_delayed).await
    }

    async fn last_event_id(&self, queue: &str) -> Result<EventId, StoreError> {
        Self::trip(&self.event_failures)?;
        self.inner.last_event_id(queue).await
    }

    async fn read_events(
        &self,
        queue: &str,
        after: EventId,
        block: Duration,
    ) -> Result<Vec<EventRecord>, StoreError> {
        Self::trip(&self.event_failures)?;
        self.inner.read_events(queue, after, block).await
    }
}
