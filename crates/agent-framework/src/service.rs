//! # Service Contract
//!
//! Every long-running component implements [`Service`] so a
//! [`Supervisor`](crate::supervisor::Supervisor) can drive it generically.
//!
//! A service owns a [`Lifecycle`] by composition. The lifecycle carries the name,
//! declared dependencies, start delay, current state and stop signal; the trait's
//! default methods simply delegate to it.
//!
//! ## Contract
//!
//! - `run()` is the long-running body. Supervision re-invokes it after **any** return:
//!   a voluntary exit looks exactly like a failure.
//! - `request_stop()` is best-effort. The body is expected to notice at its next
//!   suspension point and return promptly; nothing kills it by force.
//! - `current_state()` is what dependents see through their dependency gate.

use crate::lifecycle::Lifecycle;
use async_trait::async_trait;
use std::fmt;

/// Externally visible lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceState {
    #[default]
    NotRunning,
    Normal,
    /// Alive but unable to do useful work; waiting for supervision to restart it.
    Paused,
}

impl ServiceState {
    pub fn is_normal(self) -> bool {
        matches!(self, ServiceState::Normal)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceState::NotRunning => "Not Running",
            ServiceState::Normal => "Normal",
            ServiceState::Paused => "Paused",
        };
        f.write_str(label)
    }
}

#[async_trait]
pub trait Service: Send + 'static {
    /// The lifecycle helper this service owns.
    fn lifecycle(&self) -> &Lifecycle;

    /// The service body. Returns when stopped, or when it gives up.
    async fn run(&mut self);

    fn name(&self) -> &str {
        self.lifecycle().name()
    }

    fn request_stop(&self) {
        self.lifecycle().request_stop();
    }

    fn current_state(&self) -> ServiceState {
        self.lifecycle().state()
    }
}
