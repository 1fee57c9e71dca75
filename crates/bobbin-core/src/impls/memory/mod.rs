//! In-memory store implementation.
//!
//! One `tokio::sync::Mutex` guards every queue, so each `JobStore` call is
//! one atomic step. Blocking calls park on per-queue `Notify`s and never hold
//! the lock while waiting.

mod data;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use self::data::QueueData;
use crate::config::MemoryStoreConfig;
use crate::domain::{EventId, EventRecord, Job, JobError, JobId, JobState, LockToken, NewJob};
use crate::ports::{Clock, JobCounts, JobStore, StalledJobs, StoreError, SystemClock};

struct QueueSlot {
    data: QueueData,
    /// Woken when a job may have become claimable.
    jobs_ready: Arc<Notify>,
    /// Woken when events were appended.
    events_ready: Arc<Notify>,
}

impl QueueSlot {
    fn new(max_events: usize) -> Self {
        Self {
            data: QueueData::new(max_events),
            jobs_ready: Arc::new(Notify::new()),
            events_ready: Arc::new(Notify::new()),
        }
    }
}

pub struct InMemoryStore {
    queues: Mutex<HashMap<String, QueueSlot>>,
    clock: Arc<dyn Clock>,
    config: MemoryStoreConfig,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, MemoryStoreConfig::default())
    }

    pub fn with_config(clock: Arc<dyn Clock>, config: MemoryStoreConfig) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            clock,
            config,
        }
    }

    fn slot<'a>(&self, queues: &'a mut HashMap<String, QueueSlot>, queue: &str) -> &'a mut QueueSlot {
        queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueSlot::new(self.config.max_events))
    }

    /// Wake blocked callers whose condition may now hold.
    fn wake_waiters(slot: &QueueSlot, events_before: EventId) {
        if slot.data.can_claim() {
            slot.jobs_ready.notify_waiters();
        }
        if slot.data.last_event_id() != events_before {
            slot.events_ready.notify_waiters();
        }
    }

    /// Run one atomic operation on `queue`. Due delayed jobs are promoted
    /// first.
    async fn with_queue<R>(&self, queue: &str, op: impl FnOnce(&mut QueueData, i64) -> R) -> R {
        let now = self.clock.now_ms();
        let mut queues = self.queues.lock().await;
        let slot = self.slot(&mut queues, queue);

        let events_before = slot.data.last_event_id();
        let promoted = slot.data.promote_delayed(now);
        if promoted > 0 {
            trace!(queue, promoted, "promoted delayed jobs");
        }
        let out = op(&mut slot.data, now);
        Self::wake_waiters(slot, events_before);
        out
    }

    /// Milliseconds until the earliest delayed job is due.
    fn until_due(next_due: Option<i64>, now: i64) -> Option<Duration> {
        next_due.map(|due| Duration::from_millis(due.saturating_sub(now).max(0) as u64))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn add_job(&self, queue: &str, job: NewJob) -> Result<Job, StoreError> {
        let job = self.with_queue(queue, |data, now| data.add(job, now)).await;
        debug!(queue, job_id = %job.id, name = %job.name, "job added");
        Ok(job)
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), StoreError> {
        self.with_queue(queue, |data, now| data.set_paused(paused, now))
            .await;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        Ok(self.with_queue(queue, |data, _| data.is_paused()).await)
    }

    async fn wait_for_job(&self, queue: &str, timeout: Duration) -> Result<bool, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = self.clock.now_ms();
            let mut queues = self.queues.lock().await;
            let slot = self.slot(&mut queues, queue);
            let events_before = slot.data.last_event_id();
            slot.data.promote_delayed(now);
            Self::wake_waiters(slot, events_before);

            if slot.data.can_claim() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }

            // register before unlocking so a concurrent add cannot be missed
            let notify = Arc::clone(&slot.jobs_ready);
            let next_due = Self::until_due(slot.data.next_due(), now);
            let notified = notify.notified();
            drop(queues);

            let wake = next_due.map_or(deadline, |d| deadline.min(Instant::now() + d));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn move_to_active(
        &self,
        queue: &str,
        token: LockToken,
        lock_duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let job = self
            .with_queue(queue, |data, now| data.move_to_active(token, lock_duration, now))
            .await;
        if let Some(job) = &job {
            debug!(queue, job_id = %job.id, "job claimed");
        }
        Ok(job)
    }

    async fn move_to_completed(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        return_value: serde_json::Value,
    ) -> Result<Job, StoreError> {
        self.with_queue(queue, |data, now| data.complete(job_id, token, return_value, now))
            .await
    }

    async fn move_to_failed(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        error: &JobError,
    ) -> Result<JobState, StoreError> {
        self.with_queue(queue, |data, now| data.fail(job_id, token, error, now))
            .await
    }

    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        duration: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self
            .with_queue(queue, |data, now| data.extend_lock(job_id, token, duration, now))
            .await)
    }

    async fn move_stalled_jobs_to_wait(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledJobs, StoreError> {
        Ok(self
            .with_queue(queue, |data, now| data.recover_stalled(max_stalled_count, now))
            .await)
    }

    async fn get_job(&self, queue: &str, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.with_queue(queue, |data, _| data.get(job_id)).await)
    }

    async fn get_state(
        &self,
        queue: &str,
        job_id: &JobId,
    ) -> Result<Option<JobState>, StoreError> {
        Ok(self.with_queue(queue, |data, _| data.state_of(job_id)).await)
    }

    async fn get_counts(&self, queue: &str, states: &[JobState]) -> Result<JobCounts, StoreError> {
        Ok(self.with_queue(queue, |data, _| data.counts(states)).await)
    }

    async fn get_jobs(
        &self,
        queue: &str,
        states: &[JobState],
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .with_queue(queue, |data, _| data.jobs_in(states, start, end))
            .await)
    }

    async fn remove_job(&self, queue: &str, job_id: &JobId) -> Result<bool, StoreError> {
        self.with_queue(queue, |data, now| data.remove(job_id, now))
            .await
    }

    async fn drain(&self, queue: &str, include_delayed: bool) -> Result<usize, StoreError> {
        Ok(self
            .with_queue(queue, |data, _| data.drain(include_delayed))
            .await)
    }

    async fn last_event_id(&self, queue: &str) -> Result<EventId, StoreError> {
        Ok(self.with_queue(queue, |data, _| data.last_event_id()).await)
    }

    async fn read_events(
        &self,
        queue: &str,
        after: EventId,
        block: Duration,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let deadline = Instant::now() + block;
        loop {
            let now = self.clock.now_ms();
            let mut queues = self.queues.lock().await;
            let slot = self.slot(&mut queues, queue);
            let events_before = slot.data.last_event_id();
            slot.data.promote_delayed(now);
            Self::wake_waiters(slot, events_before);

            let records = slot.data.events_after(after);
            if !records.is_empty() {
                return Ok(records);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let notify = Arc::clone(&slot.events_ready);
            let next_due = Self::until_due(slot.data.next_due(), now);
            let notified = notify.notified();
            drop(queues);

            let wake = next_due.map_or(deadline, |d| deadline.min(Instant::now() + d));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
