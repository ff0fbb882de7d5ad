//! # Scripted Services for Tests
//!
//! [`MockService`] implements [`Service`] with behaviour scripted per run, so supervisor
//! and dependency-gate behaviour can be tested without real I/O.
//!
//! Each call to `run()` pops the next expectation; once the script is exhausted the
//! fallback applies (by default: stay `Normal` until stopped).
//!
//! ```rust
//! use agent_framework::lifecycle::Lifecycle;
//! use agent_framework::mock::MockService;
//! use agent_framework::registry::ServiceRegistry;
//! use agent_framework::service::Service;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut mock = MockService::new(Lifecycle::builder("Flaky").build(ServiceRegistry::new()));
//!     mock.expect_run().exit_after(Duration::from_millis(1));
//!     let runs = mock.run_counter();
//!
//!     mock.run().await;
//!     assert_eq!(runs.get(), 1);
//! }
//! ```

use crate::lifecycle::Lifecycle;
use crate::service::{Service, ServiceState};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a single `run()` does once its start-up gate has passed.
#[derive(Debug, Clone, PartialEq)]
pub enum RunScript {
    /// Go `Normal`, then return after the delay (a voluntary exit).
    ExitAfter(Duration),
    /// Go `Normal` and stay there until stopped.
    UntilStopped,
    /// Go `Paused`, then return.
    PauseAndExit,
}

/// Shared count of `run()` invocations.
#[derive(Debug, Clone, Default)]
pub struct RunCounter(Arc<AtomicUsize>);

impl RunCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct MockService {
    lifecycle: Lifecycle,
    script: VecDeque<RunScript>,
    fallback: RunScript,
    runs: RunCounter,
    gate_failures: RunCounter,
}

impl MockService {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            script: VecDeque::new(),
            fallback: RunScript::UntilStopped,
            runs: RunCounter::default(),
            gate_failures: RunCounter::default(),
        }
    }

    /// Adds one scripted run.
    pub fn expect_run(&mut self) -> RunExpectationBuilder<'_> {
        RunExpectationBuilder { service: self }
    }

    /// Behaviour once the script is exhausted.
    pub fn otherwise(mut self, fallback: RunScript) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn run_counter(&self) -> RunCounter {
        self.runs.clone()
    }

    /// Counts runs that returned because the start-up gate failed.
    pub fn gate_failure_counter(&self) -> RunCounter {
        self.gate_failures.clone()
    }
}

pub struct RunExpectationBuilder<'a> {
    service: &'a mut MockService,
}

impl RunExpectationBuilder<'_> {
    pub fn exit_after(self, delay: Duration) {
        self.service.script.push_back(RunScript::ExitAfter(delay));
    }

    pub fn until_stopped(self) {
        self.service.script.push_back(RunScript::UntilStopped);
    }

    pub fn pause_and_exit(self) {
        self.service.script.push_back(RunScript::PauseAndExit);
    }
}

#[async_trait]
impl Service for MockService {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&mut self) {
        self.runs.0.fetch_add(1, Ordering::SeqCst);
        if self.lifecycle.startup().await.is_err() {
            self.gate_failures.0.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let step = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            RunScript::ExitAfter(delay) => {
                self.lifecycle.set_state(ServiceState::Normal);
                tokio::select! {
                    _ = self.lifecycle.stopped() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            RunScript::UntilStopped => {
                self.lifecycle.set_state(ServiceState::Normal);
                self.lifecycle.stopped().await;
            }
            RunScript::PauseAndExit => {
                self.lifecycle.set_state(ServiceState::Paused);
            }
        }
    }
}
