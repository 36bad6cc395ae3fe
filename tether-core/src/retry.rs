use std::time::Duration;

use crate::matrix::SyncOutcome;

/// How long a sync loop waits after a failed round.
///
/// The wait doubles with every consecutive failure starting from `base`, is
/// never shorter than a rate-limit hint from the server, and never longer
/// than `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Wait before the retry that follows `failures` earlier failed rounds.
    pub fn delay_for(&self, failures: u32, server_hint: Option<Duration>) -> Duration {
        let backoff = self.base.saturating_mul(2_u32.saturating_pow(failures));
        backoff.max(server_hint.unwrap_or_default()).min(self.max)
    }

    pub fn backoff(self) -> SyncBackoff {
        SyncBackoff {
            policy: self,
            failures: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Failure streak of one sync loop.
#[derive(Debug, Clone)]
pub struct SyncBackoff {
    policy: RetryPolicy,
    failures: u32,
}

impl SyncBackoff {
    /// Record a round's outcome and return how long to wait before the next
    /// one. Only `Retry` waits; a completed batch ends the streak.
    pub fn after(&mut self, outcome: &SyncOutcome) -> Option<Duration> {
        match outcome {
            SyncOutcome::Completed { .. } => {
                self.failures = 0;
                None
            }
            SyncOutcome::Retry { retry_after } => {
                let delay = self.policy.delay_for(self.failures, *retry_after);
                self.failures = self.failures.saturating_add(1);
                Some(delay)
            }
            SyncOutcome::InvalidToken | SyncOutcome::Discarded => None,
        }
    }

    /// Consecutive failed rounds since the last completed one.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
