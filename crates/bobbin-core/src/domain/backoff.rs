//! Backoff: decides the delay before a failed job is retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::millis;

/// Backoff strategy attached to a job's options.
///
/// A zero delay means the job is requeued immediately (to waiting, or to
/// paused when the queue is paused at that moment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },

    /// delay = delay_ms * 2^(attempts_made - 1)
    Exponential { delay_ms: u64 },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed {
            delay_ms: millis(delay),
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential {
            delay_ms: millis(base),
        }
    }

    /// Delay before the next attempt.
    ///
    /// `attempts_made` counts failures so far, including the one being
    /// handled (1 on the first failure).
    ///
    /// With Exponential { delay_ms: 1000 }:
    /// - attempts_made 1: 1s
    /// - attempts_made 2: 2s
    /// - attempts_made 3: 4s
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                let factor = 1u64 << exponent;
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        }
    }
}
