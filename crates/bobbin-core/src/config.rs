//! Runtime settings.
//!
//! Plain serde structs: every field has a default so a partial JSON document
//! (or none at all) is enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::EventId;
use crate::error::BobbinError;

/// Worker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Jobs processed at the same time by one worker.
    pub concurrency: usize,

    /// Start the loop from `Worker::new`.
    pub autorun: bool,

    /// How long a claim owns its job before it counts as stalled.
    pub lock_duration_ms: u64,

    /// Lock renewal period; half of `lock_duration_ms` when unset.
    pub lock_renew_ms: Option<u64>,

    /// Period of the stalled-job scan.
    pub stalled_interval_ms: u64,

    /// Recoveries allowed before a stalled job is failed.
    pub max_stalled_count: u32,

    /// Upper bound of one blocking wait for new jobs.
    pub drain_delay_ms: u64,

    /// Pause before retrying after a store error.
    pub run_retry_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            autorun: true,
            lock_duration_ms: 30_000,
            lock_renew_ms: None,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            drain_delay_ms: 5_000,
            run_retry_delay_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn from_json(json: &str) -> Result<Self, BobbinError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BobbinError::InvalidOptions(format!("worker config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BobbinError> {
        if self.concurrency == 0 {
            return Err(BobbinError::InvalidOptions(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.lock_duration_ms == 0 {
            return Err(BobbinError::InvalidOptions(
                "lock_duration_ms must be positive".into(),
            ));
        }
        if self.lock_renew_ms == Some(0) {
            return Err(BobbinError::InvalidOptions(
                "lock_renew_ms must be positive".into(),
            ));
        }
        if self.drain_delay_ms == 0 || self.stalled_interval_ms == 0 {
            return Err(BobbinError::InvalidOptions(
                "drain_delay_ms and stalled_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn lock_renew_time(&self) -> Duration {
        Duration::from_millis(
            self.lock_renew_ms
                .unwrap_or(self.lock_duration_ms / 2)
                .max(1),
        )
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    pub fn run_retry_delay(&self) -> Duration {
        Duration::from_millis(self.run_retry_delay_ms)
    }
}

/// QueueEvents tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueEventsConfig {
    pub autorun: bool,

    /// Upper bound of one blocking read of the event log.
    pub blocking_timeout_ms: u64,

    /// Replay from just after this id. `None` delivers only events published
    /// after the reader is ready.
    pub last_event_id: Option<EventId>,

    /// Pause before retrying after a store error.
    pub retry_delay_ms: u64,
}

impl Default for QueueEventsConfig {
    fn default() -> Self {
        Self {
            autorun: true,
            blocking_timeout_ms: 10_000,
            last_event_id: None,
            retry_delay_ms: 1_000,
        }
    }
}

impl QueueEventsConfig {
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// In-memory store tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// Events kept per queue; older ones are trimmed.
    pub max_events: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self { max_events: 10_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config = WorkerConfig::from_json(r#"{ "concurrency": 4 }"#).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.drain_delay(), Duration::from_secs(5));
        assert_eq!(config.lock_renew_time(), Duration::from_secs(15));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = WorkerConfig::from_json(r#"{ "concurrency": 0 }"#).unwrap_err();
        assert!(matches!(err, BobbinError::InvalidOptions(_)));
    }

    #[test]
    fn explicit_renew_time_wins() {
        let config = WorkerConfig {
            lock_renew_ms: Some(100),
            ..WorkerConfig::default()
        };
        assert_eq!(config.lock_renew_time(), Duration::from_millis(100));
    }

    #[test]
    fn events_config_accepts_last_event_id() {
        let config: QueueEventsConfig =
            serde_json::from_str(r#"{ "last_event_id": 12 }"#).unwrap();
        assert_eq!(config.last_event_id, Some(EventId::new(12)));
        assert!(config.autorun);
    }
}
