//! Domain model (IDs, jobs, states, events, errors).

pub mod backoff;
pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod state;

pub use backoff::Backoff;
pub use errors::{ErrorKind, JobError};
pub use events::{EventKind, EventRecord, QueueEvent};
pub use ids::{EventId, JobId, LockToken, WorkerId};
pub use job::{Job, JobLock, JobOptions, NewJob};
pub use state::JobState;

use std::time::Duration;

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
