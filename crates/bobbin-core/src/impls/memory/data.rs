//! Per-queue state of the in-memory store.
//!
//! Every method here runs under the store's lock and is one atomic
//! transition. A job's state is the structure holding its id; `jobs` only
//! stores the payload and bookkeeping.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use crate::domain::{
    EventId, EventRecord, Job, JobError, JobId, JobLock, JobState, LockToken, NewJob, QueueEvent,
};
use crate::ports::{JobCounts, StalledJobs, StoreError};

pub(crate) const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

/// Delayed job entry. Derived ordering sorts earliest due time first, ties by
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedEntry {
    due_ms: i64,
    seq: u64,
    job_id: JobId,
}

fn due_at(now_ms: i64, delay: Duration) -> i64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_add(delay_ms)
}

pub(crate) struct QueueData {
    paused: bool,

    /// All job records.
    jobs: HashMap<JobId, Job>,

    /// Claimable jobs, head first.
    waiting: VecDeque<JobId>,

    /// Jobs parked while the queue is paused, in their waiting order.
    paused_jobs: VecDeque<JobId>,

    delayed: BTreeSet<DelayedEntry>,
    active: VecDeque<JobId>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,

    next_job_id: u64,
    next_delay_seq: u64,

    /// Set once `drained` was published; cleared when a job enters waiting.
    drained: bool,

    events: VecDeque<EventRecord>,
    last_event_id: EventId,
    max_events: usize,
}

impl QueueData {
    pub(crate) fn new(max_events: usize) -> Self {
        Self {
            paused: false,
            jobs: HashMap::new(),
            waiting: VecDeque::new(),
            paused_jobs: VecDeque::new(),
            delayed: BTreeSet::new(),
            active: VecDeque::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            next_job_id: 0,
            next_delay_seq: 0,
            drained: false,
            events: VecDeque::new(),
            last_event_id: EventId::ORIGIN,
            max_events: max_events.max(1),
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) fn can_claim(&self) -> bool {
        !self.paused && !self.waiting.is_empty()
    }

    pub(crate) fn next_due(&self) -> Option<i64> {
        self.delayed.first().map(|entry| entry.due_ms)
    }

    pub(crate) fn last_event_id(&self) -> EventId {
        self.last_event_id
    }

    // ------------------------------------------------------------------
    // event log
    // ------------------------------------------------------------------

    fn publish(&mut self, event: QueueEvent, now: i64) -> EventId {
        let id = self.last_event_id.next();
        self.last_event_id = id;
        self.events.push_back(EventRecord {
            id,
            timestamp: now,
            event,
        });
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
        id
    }

    pub(crate) fn events_after(&self, after: EventId) -> Vec<EventRecord> {
        let start = self.events.partition_point(|record| record.id <= after);
        self.events.range(start..).cloned().collect()
    }

    // ------------------------------------------------------------------
    // structure helpers
    // ------------------------------------------------------------------

    fn list(&self, state: JobState) -> Option<&VecDeque<JobId>> {
        match state {
            JobState::Waiting => Some(&self.waiting),
            JobState::Paused => Some(&self.paused_jobs),
            JobState::Active => Some(&self.active),
            JobState::Completed => Some(&self.completed),
            JobState::Failed => Some(&self.failed),
            JobState::Delayed => None,
        }
    }

    fn list_mut(&mut self, state: JobState) -> Option<&mut VecDeque<JobId>> {
        match state {
            JobState::Waiting => Some(&mut self.waiting),
            JobState::Paused => Some(&mut self.paused_jobs),
            JobState::Active => Some(&mut self.active),
            JobState::Completed => Some(&mut self.completed),
            JobState::Failed => Some(&mut self.failed),
            JobState::Delayed => None,
        }
    }

    fn len(&self, state: JobState) -> usize {
        match self.list(state) {
            Some(list) => list.len(),
            None => self.delayed.len(),
        }
    }

    fn ids_in(&self, state: JobState) -> Vec<JobId> {
        match self.list(state) {
            Some(list) => list.iter().cloned().collect(),
            None => self.delayed.iter().map(|e| e.job_id.clone()).collect(),
        }
    }

    fn detach(&mut self, state: JobState, job_id: &JobId) {
        match self.list_mut(state) {
            Some(list) => list.retain(|id| id != job_id),
            None => self.delayed.retain(|e| &e.job_id != job_id),
        }
    }

    pub(crate) fn state_of(&self, job_id: &JobId) -> Option<JobState> {
        if !self.jobs.contains_key(job_id) {
            return None;
        }
        JobState::ALL.into_iter().find(|state| match self.list(*state) {
            Some(list) => list.contains(job_id),
            None => self.delayed.iter().any(|e| &e.job_id == job_id),
        })
    }

    /// Put a job on the waiting-bound edge: `paused` when the flag is set,
    /// `waiting` otherwise. Publishes `waiting` either way.
    fn enqueue_waiting(&mut self, job_id: JobId, prev: Option<JobState>, now: i64) -> JobState {
        let target = if self.paused {
            self.paused_jobs.push_back(job_id.clone());
            JobState::Paused
        } else {
            self.waiting.push_back(job_id.clone());
            self.drained = false;
            JobState::Waiting
        };
        self.publish(QueueEvent::Waiting { job_id, prev }, now);
        target
    }

    fn schedule_delayed(&mut self, job_id: JobId, due_ms: i64, now: i64) {
        self.next_delay_seq += 1;
        self.delayed.insert(DelayedEntry {
            due_ms,
            seq: self.next_delay_seq,
            job_id: job_id.clone(),
        });
        self.publish(
            QueueEvent::Delayed {
                job_id,
                delay_until: due_ms,
            },
            now,
        );
    }

    fn allocate_job_id(&mut self) -> JobId {
        loop {
            self.next_job_id += 1;
            let id = JobId::from(self.next_job_id);
            if !self.jobs.contains_key(&id) {
                return id;
            }
        }
    }

    /// The caller must hold the job's current lock and the job must be active.
    fn check_owner(&self, job_id: &JobId, token: LockToken) -> Result<(), StoreError> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| StoreError::MissingJob(job_id.clone()))?;
        match job.lock {
            Some(lock) if lock.token == token && self.active.contains(job_id) => Ok(()),
            _ => Err(StoreError::LockMismatch(job_id.clone())),
        }
    }

    /// Remove from `active` and drop the lock.
    fn release(&mut self, job_id: &JobId) -> Option<&mut Job> {
        self.active.retain(|id| id != job_id);
        let job = self.jobs.get_mut(job_id)?;
        job.lock = None;
        Some(job)
    }

    // ------------------------------------------------------------------
    // transitions
    // ------------------------------------------------------------------

    /// delayed -> waiting | paused for every entry due at `now`.
    pub(crate) fn promote_delayed(&mut self, now: i64) -> usize {
        let mut promoted = 0;
        while self.delayed.first().is_some_and(|e| e.due_ms <= now) {
            let Some(entry) = self.delayed.pop_first() else {
                break;
            };
            self.enqueue_waiting(entry.job_id, Some(JobState::Delayed), now);
            promoted += 1;
        }
        promoted
    }

    pub(crate) fn add(&mut self, new_job: NewJob, now: i64) -> Job {
        let id = match &new_job.opts.job_id {
            Some(custom) => {
                let id = JobId::new(custom.clone());
                if let Some(existing) = self.jobs.get(&id) {
                    return existing.clone();
                }
                id
            }
            None => self.allocate_job_id(),
        };

        let job = Job::new(id.clone(), new_job, now);
        let delay = Duration::from_millis(job.opts.delay_ms);
        self.jobs.insert(id.clone(), job.clone());
        self.publish(
            QueueEvent::Added {
                job_id: id.clone(),
                name: job.name.clone(),
            },
            now,
        );

        if delay.is_zero() {
            self.enqueue_waiting(id, None, now);
        } else {
            self.schedule_delayed(id, due_at(now, delay), now);
        }
        job
    }

    pub(crate) fn set_paused(&mut self, paused: bool, now: i64) {
        self.paused = paused;
        if paused {
            self.paused_jobs.extend(self.waiting.drain(..));
            self.publish(QueueEvent::Paused, now);
        } else {
            if !self.paused_jobs.is_empty() {
                self.drained = false;
            }
            self.waiting.extend(self.paused_jobs.drain(..));
            self.publish(QueueEvent::Resumed, now);
        }
    }

    pub(crate) fn move_to_active(
        &mut self,
        token: LockToken,
        lock_duration: Duration,
        now: i64,
    ) -> Option<Job> {
        if self.paused {
            return None;
        }
        let Some(job_id) = self.waiting.pop_front() else {
            if !self.drained {
                self.drained = true;
                self.publish(QueueEvent::Drained, now);
            }
            return None;
        };

        let job = self.jobs.get_mut(&job_id)?;
        job.processed_on = Some(now);
        job.lock = Some(JobLock {
            token,
            expires_at: due_at(now, lock_duration),
        });
        let claimed = job.clone();

        self.active.push_back(job_id.clone());
        self.publish(
            QueueEvent::Active {
                job_id,
                prev: JobState::Waiting,
            },
            now,
        );
        Some(claimed)
    }

    pub(crate) fn complete(
        &mut self,
        job_id: &JobId,
        token: LockToken,
        return_value: serde_json::Value,
        now: i64,
    ) -> Result<Job, StoreError> {
        self.check_owner(job_id, token)?;
        let job = self
            .release(job_id)
            .ok_or_else(|| StoreError::MissingJob(job_id.clone()))?;
        job.finished_on = Some(now);
        job.return_value = Some(return_value.clone());
        let done = job.clone();

        self.completed.push_back(job_id.clone());
        self.publish(
            QueueEvent::Completed {
                job_id: job_id.clone(),
                return_value,
            },
            now,
        );
        Ok(done)
    }

    /// Retry (delayed, or the waiting-bound edge when the backoff is zero)
    /// or fail for good.
    pub(crate) fn fail(
        &mut self,
        job_id: &JobId,
        token: LockToken,
        error: &JobError,
        now: i64,
    ) -> Result<JobState, StoreError> {
        self.check_owner(job_id, token)?;
        let job = self
            .release(job_id)
            .ok_or_else(|| StoreError::MissingJob(job_id.clone()))?;
        job.attempts_made += 1;
        job.failed_reason = Some(error.message().to_string());

        let retry = error.is_retryable() && job.attempts_made < job.opts.max_attempts();
        if !retry {
            job.finished_on = Some(now);
            self.failed.push_back(job_id.clone());
            self.publish(
                QueueEvent::Failed {
                    job_id: job_id.clone(),
                    failed_reason: error.message().to_string(),
                },
                now,
            );
            return Ok(JobState::Failed);
        }

        let delay = job.opts.retry_delay(job.attempts_made);
        if delay.is_zero() {
            Ok(self.enqueue_waiting(job_id.clone(), Some(JobState::Failed), now))
        } else {
            self.schedule_delayed(job_id.clone(), due_at(now, delay), now);
            Ok(JobState::Delayed)
        }
    }

    pub(crate) fn extend_lock(
        &mut self,
        job_id: &JobId,
        token: LockToken,
        duration: Duration,
        now: i64,
    ) -> bool {
        if self.check_owner(job_id, token).is_err() {
            return false;
        }
        match self.jobs.get_mut(job_id).and_then(|job| job.lock.as_mut()) {
            Some(lock) => {
                lock.expires_at = due_at(now, duration);
                true
            }
            None => false,
        }
    }

    pub(crate) fn recover_stalled(&mut self, max_stalled_count: u32, now: i64) -> StalledJobs {
        let expired: Vec<JobId> = self
            .active
            .iter()
            .filter(|id| {
                self.jobs
                    .get(*id)
                    .and_then(|job| job.lock)
                    .is_none_or(|lock| lock.is_expired(now))
            })
            .cloned()
            .collect();

        let mut outcome = StalledJobs::default();
        for job_id in expired {
            let Some(job) = self.release(&job_id) else {
                continue;
            };
            job.stalled_counter += 1;

            if job.stalled_counter > max_stalled_count {
                job.finished_on = Some(now);
                job.failed_reason = Some(STALLED_LIMIT_REASON.to_string());
                self.failed.push_back(job_id.clone());
                self.publish(
                    QueueEvent::Failed {
                        job_id: job_id.clone(),
                        failed_reason: STALLED_LIMIT_REASON.to_string(),
                    },
                    now,
                );
                outcome.failed.push(job_id);
            } else {
                self.publish(
                    QueueEvent::Stalled {
                        job_id: job_id.clone(),
                    },
                    now,
                );
                self.enqueue_waiting(job_id.clone(), Some(JobState::Active), now);
                outcome.recovered.push(job_id);
            }
        }
        outcome
    }

    // ------------------------------------------------------------------
    // queries & removal
    // ------------------------------------------------------------------

    pub(crate) fn get(&self, job_id: &JobId) -> Option<Job> {
        self.jobs.get(job_id).cloned()
    }

    pub(crate) fn counts(&self, states: &[JobState]) -> JobCounts {
        let mut counts = JobCounts::new();
        for state in states {
            counts.insert(*state, self.len(*state));
        }
        counts
    }

    pub(crate) fn jobs_in(&self, states: &[JobState], start: usize, end: usize) -> Vec<Job> {
        if end < start {
            return Vec::new();
        }
        states
            .iter()
            .flat_map(|state| self.ids_in(*state))
            .skip(start)
            .take((end - start).saturating_add(1))
            .filter_map(|id| self.jobs.get(&id).cloned())
            .collect()
    }

    pub(crate) fn remove(&mut self, job_id: &JobId, now: i64) -> Result<bool, StoreError> {
        let Some(state) = self.state_of(job_id) else {
            return Ok(false);
        };
        if state == JobState::Active {
            return Err(StoreError::JobLocked(job_id.clone()));
        }
        self.detach(state, job_id);
        self.jobs.remove(job_id);
        self.publish(
            QueueEvent::Removed {
                job_id: job_id.clone(),
                prev: state,
            },
            now,
        );
        Ok(true)
    }

    pub(crate) fn drain(&mut self, include_delayed: bool) -> usize {
        let mut ids: Vec<JobId> = self
            .waiting
            .drain(..)
            .chain(self.paused_jobs.drain(..))
            .collect();
        if include_delayed {
            ids.extend(std::mem::take(&mut self.delayed).into_iter().map(|e| e.job_id));
        }
        for id in &ids {
            self.jobs.remove(id);
        }
        ids.len()
    }

    /// How many structures hold `job_id` (exclusivity checks in tests).
    #[cfg(test)]
    pub(crate) fn memberships(&self, job_id: &JobId) -> usize {
        JobState::ALL
            .into_iter()
            .map(|state| self.ids_in(state).iter().filter(|id| *id == job_id).count())
            .sum()
    }
}
