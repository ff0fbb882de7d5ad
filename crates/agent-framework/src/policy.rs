//! # Failure Policy
//!
//! Restart arithmetic for supervised services.
//!
//! Each return from `run()` that was not caused by a stop request counts as one failure.
//! The count decays exponentially: after `decay` has passed with no new failure, it has
//! halved. When a new failure pushes the count above `threshold`, the service is held in
//! back-off for `backoff` and the count starts over; otherwise it restarts immediately.
//!
//! ```text
//! failures(t) = failures(t0) * 0.5 ^ ((t - t0) / decay) + 1
//! ```

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct FailurePolicy {
    threshold: f64,
    decay: Duration,
    backoff: Duration,
    failures: f64,
    last_failure: Option<Instant>,
}

/// What the supervisor should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestartDecision {
    Immediate,
    Backoff(Duration),
}

impl FailurePolicy {
    pub fn new(threshold: f64, decay: Duration, backoff: Duration) -> Self {
        Self {
            threshold,
            decay,
            backoff,
            failures: 0.0,
            last_failure: None,
        }
    }

    /// Current (decayed as of the last failure) failure count.
    pub fn failures(&self) -> f64 {
        self.failures
    }

    pub fn record_failure(&mut self, now: Instant) -> RestartDecision {
        if let Some(last) = self.last_failure {
            let elapsed = now.saturating_duration_since(last);
            if self.decay.is_zero() {
                self.failures = 0.0;
            } else {
                let halvings = elapsed.as_secs_f64() / self.decay.as_secs_f64();
                self.failures *= 0.5_f64.powf(halvings);
            }
        }
        self.failures += 1.0;
        self.last_failure = Some(now);

        if self.failures > self.threshold {
            self.failures = 0.0;
            self.last_failure = None;
            RestartDecision::Backoff(self.backoff)
        } else {
            RestartDecision::Immediate
        }
    }
}
