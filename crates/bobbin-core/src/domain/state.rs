//! Job state machine states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which store structure currently holds a job.
///
/// State transitions:
/// - add -> Waiting | Delayed | Paused
/// - Delayed -> Waiting | Paused (delay elapsed, paused flag decides)
/// - Waiting -> Active (claim)
/// - Active -> Completed
/// - Active -> Delayed | Waiting | Paused (retry)
/// - Active -> Failed (attempts exhausted)
/// - Active -> Waiting | Paused | Failed (stalled recovery)
/// - Paused <-> Waiting (queue pause / resume)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Paused,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Paused,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job state '{0}'")]
pub struct UnknownState(String);

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}
