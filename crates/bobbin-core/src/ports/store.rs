//! JobStore port - queue の状態を持つ共有ストア（source of truth）
//!
//! JobStore は以下を管理します：
//! - state ごとの順序付きリスト（waiting / paused / delayed / active / completed / failed）
//! - queue ごとの paused フラグ
//! - job の lock（token + 期限）
//! - event log（publish 順、単調増加 id）
//!
//! # 設計原則
//! - 各メソッドは 1 回の不可分な操作（Redis なら 1 本の Lua script に相当）
//! - client 側で read-modify-write をしない
//! - 期限切れの delayed job は、どの操作の冒頭でも先に昇格させる

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{EventId, EventRecord, Job, JobError, JobId, JobState, LockToken, NewJob};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or timed out. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The caller no longer owns the job (lock expired and was reclaimed, or
    /// the job left `active`). The caller must discard its result.
    #[error("missing lock for job {0}")]
    LockMismatch(JobId),

    #[error("job {0} not found")]
    MissingJob(JobId),

    /// The job is locked by a worker and cannot be removed.
    #[error("job {0} is locked by a worker")]
    JobLocked(JobId),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Outcome of one stalled-job scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledJobs {
    /// Moved back to waiting (or paused).
    pub recovered: Vec<JobId>,
    /// Exceeded `max_stalled_count` and moved to failed.
    pub failed: Vec<JobId>,
}

impl StalledJobs {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.failed.is_empty()
    }
}

/// Job counts for the requested states only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct JobCounts(BTreeMap<JobState, usize>);

impl JobCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: JobState, count: usize) {
        self.0.insert(state, count);
    }

    /// Zero when the state was not requested.
    pub fn get(&self, state: JobState) -> usize {
        self.0.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobState, usize)> + '_ {
        self.0.iter().map(|(state, count)| (*state, *count))
    }
}

impl<const N: usize> From<[(JobState, usize); N]> for JobCounts {
    fn from(pairs: [(JobState, usize); N]) -> Self {
        Self(BTreeMap::from(pairs))
    }
}

/// Store port (interface).
///
/// `queue` is the queue name; a queue springs into existence on first use.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job: delayed if it has a delay, else paused if the queue is
    /// paused, else waiting.
    async fn add_job(&self, queue: &str, job: NewJob) -> Result<Job, StoreError>;

    /// Set or clear the queue's paused flag, moving every waiting job to
    /// paused (or back) in order, in the same operation.
    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), StoreError>;

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError>;

    /// Block until a job can be claimed or `timeout` elapses.
    ///
    /// Does not take the job; a `true` result may lose the race to another
    /// worker's claim. Dropping the future is always safe.
    async fn wait_for_job(&self, queue: &str, timeout: Duration) -> Result<bool, StoreError>;

    /// Claim the head of `waiting`: move it to `active` under `token`,
    /// locked for `lock_duration`. `None` when paused or nothing is waiting.
    async fn move_to_active(
        &self,
        queue: &str,
        token: LockToken,
        lock_duration: Duration,
    ) -> Result<Option<Job>, StoreError>;

    async fn move_to_completed(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        return_value: serde_json::Value,
    ) -> Result<Job, StoreError>;

    /// Apply the retry policy to a failed execution; returns the state the
    /// job ended up in.
    async fn move_to_failed(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        error: &JobError,
    ) -> Result<JobState, StoreError>;

    /// Push the lock expiry forward. `false` when `token` no longer owns it.
    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        duration: Duration,
    ) -> Result<bool, StoreError>;

    /// Recover active jobs whose lock expired.
    async fn move_stalled_jobs_to_wait(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledJobs, StoreError>;

    async fn get_job(&self, queue: &str, job_id: &JobId) -> Result<Option<Job>, StoreError>;

    async fn get_state(&self, queue: &str, job_id: &JobId)
    -> Result<Option<JobState>, StoreError>;

    async fn get_counts(&self, queue: &str, states: &[JobState]) -> Result<JobCounts, StoreError>;

    /// Jobs in the given states, in list order, `start..=end` (inclusive,
    /// `end` clamped).
    async fn get_jobs(
        &self,
        queue: &str,
        states: &[JobState],
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Delete a job from whatever structure holds it. `false` when absent.
    async fn remove_job(&self, queue: &str, job_id: &JobId) -> Result<bool, StoreError>;

    /// Delete every waiting and paused job, and delayed ones if asked.
    async fn drain(&self, queue: &str, include_delayed: bool) -> Result<usize, StoreError>;

    /// Id of the newest event, or `EventId::ORIGIN` when none.
    async fn last_event_id(&self, queue: &str) -> Result<EventId, StoreError>;

    /// Events with an id greater than `after`, oldest first. Blocks up to
    /// `block` when there are none yet.
    async fn read_events(
        &self,
        queue: &str,
        after: EventId,
        block: Duration,
    ) -> Result<Vec<EventRecord>, StoreError>;
}
