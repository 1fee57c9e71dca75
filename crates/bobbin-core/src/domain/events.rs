//! Events published by the store on every state transition.

use serde::{Deserialize, Serialize};

use super::ids::{EventId, JobId};
use super::state::JobState;

/// What happened. Each variant is one message on the queue's event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum QueueEvent {
    Added {
        job_id: JobId,
        name: String,
    },

    /// The job entered `waiting` or, while the queue is paused, `paused`.
    /// `prev` is `None` for a freshly added job.
    Waiting {
        job_id: JobId,
        prev: Option<JobState>,
    },

    Delayed {
        job_id: JobId,
        /// Unix ms at which the job becomes eligible.
        delay_until: i64,
    },

    Active {
        job_id: JobId,
        prev: JobState,
    },

    Completed {
        job_id: JobId,
        return_value: serde_json::Value,
    },

    /// Terminal failure; retried failures show up as `Waiting`/`Delayed`.
    Failed {
        job_id: JobId,
        failed_reason: String,
    },

    Stalled {
        job_id: JobId,
    },

    Removed {
        job_id: JobId,
        prev: JobState,
    },

    Paused,
    Resumed,

    /// A claim found nothing to do.
    Drained,
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::Added { .. } => EventKind::Added,
            QueueEvent::Waiting { .. } => EventKind::Waiting,
            QueueEvent::Delayed { .. } => EventKind::Delayed,
            QueueEvent::Active { .. } => EventKind::Active,
            QueueEvent::Completed { .. } => EventKind::Completed,
            QueueEvent::Failed { .. } => EventKind::Failed,
            QueueEvent::Stalled { .. } => EventKind::Stalled,
            QueueEvent::Removed { .. } => EventKind::Removed,
            QueueEvent::Paused => EventKind::Paused,
            QueueEvent::Resumed => EventKind::Resumed,
            QueueEvent::Drained => EventKind::Drained,
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            QueueEvent::Added { job_id, .. }
            | QueueEvent::Waiting { job_id, .. }
            | QueueEvent::Delayed { job_id, .. }
            | QueueEvent::Active { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Stalled { job_id }
            | QueueEvent::Removed { job_id, .. } => Some(job_id),
            QueueEvent::Paused | QueueEvent::Resumed | QueueEvent::Drained => None,
        }
    }
}

/// Event name used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Stalled,
    Removed,
    Paused,
    Resumed,
    Drained,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Waiting => "waiting",
            EventKind::Delayed => "delayed",
            EventKind::Active => "active",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Stalled => "stalled",
            EventKind::Removed => "removed",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Drained => "drained",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event together with its position in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    /// Publish time (unix ms).
    pub timestamp: i64,
    pub event: QueueEvent,
}
