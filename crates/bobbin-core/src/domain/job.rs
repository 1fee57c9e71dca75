//! Job entity and the options a producer attaches to it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backoff::Backoff;
use super::ids::{JobId, LockToken};

/// Per-job options. Missing fields fall back to `JobOptions::default()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Milliseconds to keep the job in `delayed` before it becomes eligible.
    pub delay_ms: u64,

    /// Total number of executions allowed (first run included).
    pub attempts: u32,

    /// Delay between a failure and the next attempt. `None` retries at once.
    pub backoff: Option<Backoff>,

    /// Caller-chosen id. Adding a job whose id already exists is a no-op that
    /// returns the stored job.
    pub job_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            attempts: 1,
            backoff: None,
            job_id: None,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = super::millis(delay);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Attempts never drop below one execution.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Delay before retry number `attempts_made + 1`; zero without backoff.
    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        self.backoff
            .map(|b| b.delay_for(attempts_made))
            .unwrap_or(Duration::ZERO)
    }
}

/// Ownership of an active job. Present only while the job is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub token: LockToken,

    /// Unix milliseconds after which the job counts as stalled.
    pub expires_at: i64,
}

impl JobLock {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// A job as stored. Its state is not a field: it is whichever store
/// structure holds the id (see `JobState`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,

    /// Failed executions so far.
    pub attempts_made: u32,

    /// How many times the job was recovered after its lock expired.
    pub stalled_counter: u32,

    /// Creation time (unix ms).
    pub timestamp: i64,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,

    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,

    pub lock: Option<JobLock>,
}

impl Job {
    pub(crate) fn new(id: JobId, new_job: NewJob, now_ms: i64) -> Self {
        Self {
            id,
            name: new_job.name,
            data: new_job.data,
            opts: new_job.opts,
            attempts_made: 0,
            stalled_counter: 0,
            timestamp: now_ms,
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            return_value: None,
            lock: None,
        }
    }

    /// Decode the payload into a concrete type.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// What a producer hands to the store; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub opts: JobOptions,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: serde_json::Value, opts: JobOptions) -> Self {
        Self {
            name: name.into(),
            data,
            opts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_run_once_without_delay() {
        let opts = JobOptions::default();
        assert_eq!(opts.delay_ms, 0);
        assert_eq!(opts.max_attempts(), 1);
        assert_eq!(opts.retry_delay(1), Duration::ZERO);
    }

    #[test]
    fn zero_attempts_still_allows_one_execution() {
        let opts = JobOptions::new().with_attempts(0);
        assert_eq!(opts.max_attempts(), 1);
    }

    #[test]
    fn options_without_fields_get_defaults() {
        let opts: JobOptions = serde_json::from_str(r#"{ "delay_ms": 300 }"#).unwrap();
        assert_eq!(opts.delay_ms, 300);
        assert_eq!(opts.attempts, 1);
        assert!(opts.backoff.is_none());
    }

    #[test]
    fn lock_expiry_is_inclusive() {
        let lock = JobLock {
            token: LockToken::from_ulid(ulid::Ulid::nil()),
            expires_at: 1_000,
        };
        assert!(!lock.is_expired(999));
        assert!(lock.is_expired(1_000));
    }

    #[test]
    fn data_as_decodes_payload() {
        #[derive(Deserialize)]
        struct Greeting {
            name: String,
        }
        let job = Job::new(
            JobId::from(1),
            NewJob::new("greet", serde_json::json!({"name": "bobbin"}), JobOptions::default()),
            0,
        );
        let greeting: Greeting = job.data_as().unwrap();
        assert_eq!(greeting.name, "bobbin");
    }
}
