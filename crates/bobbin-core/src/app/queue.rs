//! Queue - control plane
//!
//! job の追加、queue 全体の pause/resume、状態の問い合わせを行います。
//! worker loop は持ちません。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{Job, JobId, JobOptions, JobState, NewJob};
use crate::error::BobbinError;
use crate::ports::{JobCounts, JobStore};

pub struct Queue {
    name: String,
    store: Arc<dyn JobStore>,
    closed: AtomicBool,
}

impl Queue {
    pub fn new(name: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        Self {
            name: name.into(),
            store,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_open(&self) -> Result<(), BobbinError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BobbinError::Closed(format!("queue {}", self.name)));
        }
        Ok(())
    }

    /// Enqueue a job: delayed with a delay, paused while the queue is paused,
    /// otherwise waiting.
    pub async fn add(
        &self,
        name: impl Into<String>,
        data: Value,
        opts: JobOptions,
    ) -> Result<Job, BobbinError> {
        self.ensure_open()?;
        let job = self
            .store
            .add_job(&self.name, NewJob::new(name, data, opts))
            .await?;
        Ok(job)
    }

    /// Each job is one atomic add; a failure leaves the earlier ones in place.
    pub async fn add_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, BobbinError> {
        self.ensure_open()?;
        let mut added = Vec::with_capacity(jobs.len());
        for job in jobs {
            added.push(self.store.add_job(&self.name, job).await?);
        }
        debug!(queue = %self.name, count = added.len(), "bulk add");
        Ok(added)
    }

    /// Stop dispatch queue-wide. Waiting jobs move to paused; delayed and
    /// active ones are left alone.
    pub async fn pause(&self) -> Result<(), BobbinError> {
        self.ensure_open()?;
        self.store.set_paused(&self.name, true).await?;
        info!(queue = %self.name, "queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), BobbinError> {
        self.ensure_open()?;
        self.store.set_paused(&self.name, false).await?;
        info!(queue = %self.name, "queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, BobbinError> {
        self.ensure_open()?;
        Ok(self.store.is_paused(&self.name).await?)
    }

    pub async fn get_job_counts(&self, states: &[JobState]) -> Result<JobCounts, BobbinError> {
        self.ensure_open()?;
        Ok(self.store.get_counts(&self.name, states).await?)
    }

    /// Sum of the counts of `states`.
    pub async fn get_job_count_by_types(&self, states: &[JobState]) -> Result<usize, BobbinError> {
        Ok(self.get_job_counts(states).await?.total())
    }

    /// Jobs not yet processed: waiting, paused and delayed.
    pub async fn count(&self) -> Result<usize, BobbinError> {
        self.get_job_count_by_types(&[JobState::Waiting, JobState::Paused, JobState::Delayed])
            .await
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, BobbinError> {
        self.ensure_open()?;
        Ok(self.store.get_job(&self.name, job_id).await?)
    }

    pub async fn get_job_state(&self, job_id: &JobId) -> Result<Option<JobState>, BobbinError> {
        self.ensure_open()?;
        Ok(self.store.get_state(&self.name, job_id).await?)
    }

    /// Jobs in `states`, positions `start..=end`.
    pub async fn get_jobs(
        &self,
        states: &[JobState],
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, BobbinError> {
        self.ensure_open()?;
        Ok(self.store.get_jobs(&self.name, states, start, end).await?)
    }

    /// Remove a job. Refused with `JobLocked` while a worker holds it.
    pub async fn remove(&self, job_id: &JobId) -> Result<bool, BobbinError> {
        self.ensure_open()?;
        Ok(self.store.remove_job(&self.name, job_id).await?)
    }

    /// Delete waiting and paused jobs, plus delayed ones when asked.
    pub async fn drain(&self, include_delayed: bool) -> Result<usize, BobbinError> {
        self.ensure_open()?;
        let removed = self.store.drain(&self.name, include_delayed).await?;
        info!(queue = %self.name, removed, include_delayed, "queue drained");
        Ok(removed)
    }

    /// Release the handle. Later calls fail with `Closed`; the store and its
    /// jobs are untouched.
    pub async fn close(&self) -> Result<(), BobbinError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(queue = %self.name, "queue closed");
        }
        Ok(())
    }
}
